use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::error::{RagError, RagResult};
use crate::llm::{Generator, ResolvedModel};
use crate::models::{Namespace, PromptTemplate, QueryAnswer, QueryEvent, QueryMetadata, QueryRequest};
use crate::rag::prompt;
use crate::rag::retrieval::{Retrieval, Retriever};

/// Query after validation: everything needed to retrieve and generate.
struct PreparedQuery {
    id: String,
    namespace: Namespace,
    template: PromptTemplate,
    template_id: Option<Uuid>,
    user_input: String,
    additional_context: Map<String, Value>,
    model: ResolvedModel,
    top_k: usize,
}

enum Phase {
    Start(PreparedQuery),
    Open(PreparedQuery),
    Streaming {
        id: String,
        template_id: Option<Uuid>,
        fragments: BoxStream<'static, RagResult<String>>,
    },
    Finished,
}

pub struct QueryService {
    catalog: Arc<dyn Catalog>,
    retriever: Retriever,
    generator: Arc<Generator>,
    default_top_k: usize,
}

impl QueryService {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        retriever: Retriever,
        generator: Arc<Generator>,
        default_top_k: usize,
    ) -> Self {
        Self {
            catalog,
            retriever,
            generator,
            default_top_k,
        }
    }

    async fn prepare(&self, workspace_id: &str, request: QueryRequest) -> RagResult<PreparedQuery> {
        let namespace = Namespace::for_workspace(workspace_id)?;
        let raw_prompt = request.prompt.filter(|p| !p.trim().is_empty());

        let (template, template_id) = match request.template_id {
            Some(id) => (self.catalog.get_template(id).await?, Some(id)),
            None if raw_prompt.is_some() => (PromptTemplate::assistant_default(), None),
            None => {
                return Err(RagError::InvalidInput(
                    "either template_id or prompt is required".to_string(),
                ))
            }
        };

        let top_k = request.top_k.unwrap_or(self.default_top_k);
        if top_k == 0 {
            return Err(RagError::InvalidInput("top_k must be positive".to_string()));
        }

        let requested_model = request.model.as_deref().or(template.llm_model.as_deref());
        let model = self.generator.resolve(requested_model)?;

        Ok(PreparedQuery {
            id: request.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            namespace,
            user_input: request.user_input.or(raw_prompt).unwrap_or_default(),
            template,
            template_id,
            additional_context: request.additional_context,
            model,
            top_k,
        })
    }

    async fn retrieve(&self, query: &PreparedQuery) -> RagResult<Retrieval> {
        if query.user_input.trim().is_empty() {
            return Ok(Retrieval::default());
        }
        self.retriever
            .retrieve(&query.namespace, &query.user_input, query.top_k)
            .await
    }

    fn compose(&self, query: &PreparedQuery, retrieval: &Retrieval) -> String {
        prompt::compose(
            &query.template,
            &query.user_input,
            &retrieval.context,
            &query.additional_context,
        )
    }

    async fn touch_template(&self, template_id: Option<Uuid>) {
        let Some(id) = template_id else {
            return;
        };
        if let Err(e) = self.catalog.touch_template(id, Utc::now()).await {
            tracing::warn!(template = %id, "failed to update template last_used_at: {}", e);
        }
    }

    /// Answer a query in one response.
    pub async fn answer(&self, workspace_id: &str, request: QueryRequest) -> RagResult<QueryAnswer> {
        let started = Utc::now();
        let query = self.prepare(workspace_id, request).await?;
        tracing::info!(
            request = %query.id,
            workspace = %query.namespace,
            model = %query.model.id,
            "answering query"
        );

        let retrieval = self.retrieve(&query).await?;
        let prompt = self.compose(&query, &retrieval);
        let (result, meta) = self.generator.generate(&prompt, &query.model).await?;

        self.touch_template(query.template_id).await;

        Ok(QueryAnswer {
            id: query.id,
            result,
            metadata: QueryMetadata {
                model: meta.model,
                provider: meta.provider,
                sources: retrieval.source_scores,
                prompt_tokens: meta.prompt_tokens,
                completion_tokens: meta.completion_tokens,
                duration_ms: (Utc::now() - started).num_milliseconds(),
            },
        })
    }

    /// Answer a query as `start, chunk*, (end | error)` events.
    ///
    /// Validation failures (bad workspace, unknown template, no model) are
    /// returned before any event. Anything that fails later becomes the
    /// terminal `error` event. Dropping the stream stops generation.
    pub async fn stream(
        self: &Arc<Self>,
        workspace_id: &str,
        request: QueryRequest,
    ) -> RagResult<BoxStream<'static, QueryEvent>> {
        let query = self.prepare(workspace_id, request).await?;
        tracing::info!(
            request = %query.id,
            workspace = %query.namespace,
            model = %query.model.id,
            "streaming query"
        );

        let service = Arc::clone(self);
        let events = stream::unfold(Phase::Start(query), move |phase| {
            let service = Arc::clone(&service);
            async move { service.advance(phase).await }
        });
        Ok(events.boxed())
    }

    async fn advance(&self, mut phase: Phase) -> Option<(QueryEvent, Phase)> {
        loop {
            match phase {
                Phase::Start(query) => {
                    let id = query.id.clone();
                    return Some((QueryEvent::Start { id }, Phase::Open(query)));
                }
                Phase::Open(query) => match self.open(&query).await {
                    Ok(fragments) => {
                        phase = Phase::Streaming {
                            id: query.id,
                            template_id: query.template_id,
                            fragments,
                        };
                    }
                    Err(e) => {
                        tracing::error!(request = %query.id, "query failed: {}", e);
                        let event = QueryEvent::Error {
                            id: query.id,
                            message: e.to_string(),
                        };
                        return Some((event, Phase::Finished));
                    }
                },
                Phase::Streaming {
                    id,
                    template_id,
                    mut fragments,
                } => {
                    return match fragments.next().await {
                        Some(Ok(content)) => {
                            let event = QueryEvent::Chunk {
                                id: id.clone(),
                                content,
                            };
                            Some((
                                event,
                                Phase::Streaming {
                                    id,
                                    template_id,
                                    fragments,
                                },
                            ))
                        }
                        Some(Err(e)) => {
                            tracing::error!(request = %id, "generation stream failed: {}", e);
                            let event = QueryEvent::Error {
                                id,
                                message: e.to_string(),
                            };
                            Some((event, Phase::Finished))
                        }
                        None => {
                            self.touch_template(template_id).await;
                            Some((QueryEvent::End { id }, Phase::Finished))
                        }
                    };
                }
                Phase::Finished => return None,
            }
        }
    }

    async fn open(&self, query: &PreparedQuery) -> RagResult<BoxStream<'static, RagResult<String>>> {
        let retrieval = self.retrieve(query).await?;
        let prompt = self.compose(query, &retrieval);
        self.generator.generate_stream(&prompt, &query.model).await
    }
}
