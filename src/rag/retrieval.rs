use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::RagResult;
use crate::models::{Namespace, RetrievedChunk, SourceScore};
use crate::rag::embeddings::Embedder;
use crate::rag::vector_store::VectorIndex;

#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    /// Chunk texts joined by newlines, best match first.
    pub context: String,
    pub results: Vec<RetrievedChunk>,
    /// Best score per source document.
    pub source_scores: Vec<SourceScore>,
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    min_score: Option<f32>,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        min_score: Option<f32>,
    ) -> Self {
        Self {
            embedder,
            index,
            min_score,
        }
    }

    pub async fn retrieve(
        &self,
        namespace: &Namespace,
        query: &str,
        top_k: usize,
    ) -> RagResult<Retrieval> {
        let query_embedding = self.embedder.embed(query).await?;
        let mut results = self.index.query(namespace, &query_embedding, top_k).await?;

        if let Some(floor) = self.min_score {
            results.retain(|r| r.score >= floor);
        }

        if results.is_empty() {
            tracing::debug!(workspace = %namespace, "no matching chunks");
            return Ok(Retrieval::default());
        }

        let context = results
            .iter()
            .map(|r| r.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let source_scores = best_per_source(&results);
        for s in &source_scores {
            tracing::debug!(workspace = %namespace, source = %s.source, score = s.score, "retrieved");
        }

        Ok(Retrieval {
            context,
            results,
            source_scores,
        })
    }
}

fn best_per_source(results: &[RetrievedChunk]) -> Vec<SourceScore> {
    let mut best: BTreeMap<&str, f32> = BTreeMap::new();
    for r in results {
        let entry = best.entry(r.source.as_str()).or_insert(r.score);
        if r.score > *entry {
            *entry = r.score;
        }
    }
    let mut scores: Vec<SourceScore> = best
        .into_iter()
        .map(|(source, score)| SourceScore {
            source: source.to_string(),
            score,
        })
        .collect();
    scores.sort_by(|a, b| b.score.total_cmp(&a.score));
    scores
}
