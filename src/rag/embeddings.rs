//! Embedding providers.
//!
//! - [`OpenAIEmbedder`] calls an OpenAI-compatible `/embeddings` endpoint with
//!   batching, retry and exponential backoff.
//! - [`LocalEmbedder`] runs a user-defined ONNX model through fastembed; no
//!   network calls.
//!
//! Both guarantee that every vector has exactly [`Embedder::dims`] values.
//!
//! # Retry strategy (HTTP)
//!
//! - 429 and 5xx → retry
//! - other 4xx → fail immediately
//! - transport errors and timeouts → retry
//! - backoff 1s, 2s, 4s, ... capped at 32s

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fastembed::{InitOptionsUserDefined, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel};
use serde::Deserialize;

use crate::error::{RagError, RagResult};
use crate::settings::{EmbeddingBackend, EmbeddingSettings};

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;

    /// Embed `texts`, returning one vector per input in the same order.
    async fn embed_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> RagResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::Provider("empty embedding response".to_string()))
    }
}

pub fn create_embedder(settings: &EmbeddingSettings) -> RagResult<Arc<dyn Embedder>> {
    match settings.provider {
        EmbeddingBackend::OpenAI => Ok(Arc::new(OpenAIEmbedder::new(settings)?)),
        EmbeddingBackend::Local => Ok(Arc::new(LocalEmbedder::new(settings)?)),
    }
}

/// Fail with `Configuration` when any vector has the wrong length.
pub fn ensure_dimension(vectors: &[Vec<f32>], expected: usize, model: &str) -> RagResult<()> {
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
        return Err(RagError::Configuration(format!(
            "model {} returned {}-dimensional vectors, expected {}",
            model,
            bad.len(),
            expected
        )));
    }
    Ok(())
}

// ============ OpenAI ============

pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dims: usize,
    max_retries: u32,
    batch_size: usize,
}

impl OpenAIEmbedder {
    pub fn new(settings: &EmbeddingSettings) -> RagResult<Self> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                RagError::Configuration("embedding.api_key (OPENAI_API_KEY) is not set".into())
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| RagError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            dims: settings.dims,
            max_retries: settings.max_retries,
            batch_size: settings.batch_size.max(1),
        })
    }

    async fn embed_once(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let url = format!("{}/embeddings", self.base_url);

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::warn!(attempt, delay_secs = delay.as_secs(), "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.map_err(RagError::provider)?;

                    if status.is_success() {
                        let vectors = parse_embedding_response(&text, texts.len())?;
                        ensure_dimension(&vectors, self.dims, &self.model)?;
                        return Ok(vectors);
                    }

                    // 429 / 5xx: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(RagError::Provider(format!(
                            "embedding API error {}: {}",
                            status, text
                        )));
                        continue;
                    }

                    return Err(RagError::Provider(format!(
                        "embedding API error {}: {}",
                        status, text
                    )));
                }
                Err(e) => {
                    last_err = Some(RagError::Provider(format!("embedding request failed: {}", e)));
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| RagError::Provider("embedding failed after retries".to_string())))
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_once(batch).await?);
        }
        Ok(vectors)
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

/// Parse an `/embeddings` response body, restoring input order.
fn parse_embedding_response(body: &str, expected: usize) -> RagResult<Vec<Vec<f32>>> {
    let mut parsed: EmbeddingResponse = serde_json::from_str(body)
        .map_err(|e| RagError::Provider(format!("malformed embedding response: {}", e)))?;

    if parsed.data.len() != expected {
        return Err(RagError::Provider(format!(
            "embedding response has {} items, expected {}",
            parsed.data.len(),
            expected
        )));
    }

    parsed.data.sort_by_key(|item| item.index);
    if parsed.data.iter().enumerate().any(|(i, item)| item.index != i) {
        return Err(RagError::Provider(
            "embedding response indices are not contiguous".to_string(),
        ));
    }

    Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
}

// ============ Local (fastembed) ============

pub struct LocalEmbedder {
    model: Arc<TextEmbedding>,
    model_name: String,
    dims: usize,
    batch_size: usize,
}

impl LocalEmbedder {
    pub fn new(settings: &EmbeddingSettings) -> RagResult<Self> {
        tracing::info!("Initializing embedding model from local files...");

        let model_dir = settings.model_dir.as_path();
        if !model_dir.exists() {
            return Err(RagError::Configuration(format!(
                "model directory not found: {}",
                model_dir.display()
            )));
        }

        let user_model = UserDefinedEmbeddingModel {
            onnx_file: read_model_file(model_dir, "model.onnx")?,
            tokenizer_files: TokenizerFiles {
                tokenizer_file: read_model_file(model_dir, "tokenizer.json")?,
                config_file: read_model_file(model_dir, "config.json")?,
                special_tokens_map_file: read_model_file(model_dir, "special_tokens_map.json")?,
                tokenizer_config_file: read_model_file(model_dir, "tokenizer_config.json")?,
            },
        };

        let model = TextEmbedding::try_new_from_user_defined(user_model, InitOptionsUserDefined::default())
            .map_err(|e| RagError::Configuration(format!("failed to initialize embedding model: {}", e)))?;

        tracing::info!(model = %settings.model, dims = settings.dims, "Local embedding model ready");

        Ok(Self {
            model: Arc::new(model),
            model_name: settings.model.clone(),
            dims: settings.dims,
            batch_size: settings.batch_size.max(1),
        })
    }
}

fn read_model_file(dir: &Path, name: &str) -> RagResult<Vec<u8>> {
    std::fs::read(dir.join(name))
        .map_err(|e| RagError::Configuration(format!("failed to read {}: {}", name, e)))
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let model = self.model.clone();
        let texts = texts.to_vec();
        let batch_size = self.batch_size;

        // ONNX inference is CPU bound
        let vectors = tokio::task::spawn_blocking(move || model.embed(texts, Some(batch_size)))
            .await
            .map_err(|e| RagError::Provider(format!("embedding task failed: {}", e)))?
            .map_err(|e| RagError::Provider(format!("local embedding failed: {}", e)))?;

        ensure_dimension(&vectors, self.dims, &self.model_name)?;
        Ok(vectors)
    }
}
