//! Document ingestion: fetch → extract → chunk → embed → upsert.
//!
//! Vector ids are `"{key}-chunk-{i}"`, so running the pipeline again for the
//! same document overwrites its vectors instead of duplicating them. Any
//! failed run can simply be retried.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::Instrument;

use crate::catalog::Catalog;
use crate::error::{RagError, RagResult};
use crate::indexer::chunker;
use crate::indexer::extractor::TextExtractor;
use crate::models::{DocumentRecord, Namespace, RecordMetadata, VectorRecord};
use crate::rag::embeddings::Embedder;
use crate::rag::vector_store::VectorIndex;
use crate::settings::ChunkingSettings;
use crate::storage::{split_key, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStep {
    Fetched,
    Extracted,
    Chunked,
    Embedded,
    Indexed,
    Done,
}

impl IngestStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStep::Fetched => "fetched",
            IngestStep::Extracted => "extracted",
            IngestStep::Chunked => "chunked",
            IngestStep::Embedded => "embedded",
            IngestStep::Indexed => "indexed",
            IngestStep::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    pub chunking: ChunkingSettings,
    pub batch_size: usize,
    /// Directory for temporary document copies; the system default if unset.
    pub temp_dir: Option<PathBuf>,
}

pub struct IngestPipeline {
    store: Arc<dyn ObjectStore>,
    extractor: Arc<dyn TextExtractor>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    catalog: Arc<dyn Catalog>,
    settings: PipelineSettings,
}

fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn step(workspace: &Namespace, key: &str, step: IngestStep) {
    tracing::info!(workspace = %workspace, key = %key, step = step.as_str(), "ingest step");
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        extractor: Arc<dyn TextExtractor>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        catalog: Arc<dyn Catalog>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            extractor,
            embedder,
            index,
            catalog,
            settings,
        }
    }

    /// Ingest one stored document into its workspace namespace and return
    /// the number of chunks indexed.
    pub async fn ingest(&self, workspace_id: &str, document_key: &str) -> RagResult<usize> {
        let namespace = Namespace::for_workspace(workspace_id)?;
        let span = tracing::info_span!("ingest", workspace = %namespace, key = %document_key);

        let result = self.run(&namespace, document_key).instrument(span).await;
        if let Err(ref e) = result {
            tracing::error!(
                workspace = %namespace,
                key = %document_key,
                step = "failed",
                "ingestion failed: {}",
                e
            );
        }
        result
    }

    async fn run(&self, namespace: &Namespace, key: &str) -> RagResult<usize> {
        let (key_workspace, _) = split_key(key)?;
        if &key_workspace != namespace {
            return Err(RagError::InvalidInput(format!(
                "document {} does not belong to workspace {}",
                key, namespace
            )));
        }

        let bytes = self.store.get(key).await?;
        let file_size = bytes.len() as i64;
        step(namespace, key, IngestStep::Fetched);

        let text = self.extract(key, bytes).await?;
        step(namespace, key, IngestStep::Extracted);

        let previous = match self.catalog.get_document(namespace.as_str(), key).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(workspace = %namespace, key = %key, "catalog lookup failed: {}", e);
                None
            }
        };

        let chunks = if text.trim().is_empty() {
            Vec::new()
        } else {
            chunker::split(
                &text,
                self.settings.chunking.chunk_size,
                self.settings.chunking.chunk_overlap,
            )?
        };
        step(namespace, key, IngestStep::Chunked);

        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.settings.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let batch_vectors = self.embedder.embed_batch(&texts).await?;
            if batch_vectors.len() != texts.len() {
                return Err(RagError::Provider(format!(
                    "embedder returned {} vectors for {} chunks",
                    batch_vectors.len(),
                    texts.len()
                )));
            }
            vectors.extend(batch_vectors);
        }

        let dimension = self.index.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(RagError::Configuration(format!(
                "embedding model {} produces {}-dimensional vectors but the index expects {}",
                self.embedder.model_name(),
                bad.len(),
                dimension
            )));
        }
        step(namespace, key, IngestStep::Embedded);

        let records: Vec<VectorRecord> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, values)| VectorRecord {
                id: VectorRecord::record_id(key, chunk.index),
                values,
                metadata: RecordMetadata {
                    content_hash: content_hash(&chunk.text),
                    text: chunk.text,
                    source: key.to_string(),
                    workspace: namespace.as_str().to_string(),
                    chunk_index: chunk.index,
                },
            })
            .collect();
        let count = records.len();

        if !records.is_empty() {
            self.index.upsert(namespace, records).await?;
        }
        step(namespace, key, IngestStep::Indexed);

        let previous_count = previous
            .as_ref()
            .and_then(|r| r.chunk_count)
            .map(|c| c.max(0) as usize)
            .unwrap_or(0);
        if previous_count > count {
            let stale: Vec<String> = (count..previous_count)
                .map(|i| VectorRecord::record_id(key, i))
                .collect();
            if let Err(e) = self.index.delete(namespace, &stale).await {
                tracing::warn!(
                    workspace = %namespace,
                    key = %key,
                    stale = stale.len(),
                    "failed to delete stale chunks: {}",
                    e
                );
            }
        }

        let now = Utc::now();
        let record = match previous {
            Some(prev) => DocumentRecord {
                file_size,
                chunk_count: Some(count as i32),
                indexed_at: Some(now),
                ..prev
            },
            None => DocumentRecord {
                workspace_id: namespace.as_str().to_string(),
                file_path: key.to_string(),
                filename: key.rsplit('/').next().unwrap_or(key).to_string(),
                file_size,
                content_type: None,
                chunk_count: Some(count as i32),
                indexed_at: Some(now),
                created_at: now,
            },
        };
        if let Err(e) = self.catalog.upsert_document(&record).await {
            tracing::warn!(workspace = %namespace, key = %key, "failed to record chunk count: {}", e);
        }

        step(namespace, key, IngestStep::Done);
        tracing::info!(workspace = %namespace, key = %key, chunks = count, "document indexed");
        Ok(count)
    }

    /// Extract text from a temporary copy that is removed on every exit path.
    async fn extract(&self, key: &str, bytes: Vec<u8>) -> RagResult<String> {
        let extractor = self.extractor.clone();
        let temp_dir = self.settings.temp_dir.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || {
            let suffix = key
                .rsplit('/')
                .next()
                .and_then(|name| name.rsplit_once('.'))
                .map(|(_, ext)| format!(".{}", ext))
                .unwrap_or_default();

            let mut builder = tempfile::Builder::new();
            builder.prefix("rag-ingest-").suffix(&suffix);
            let mut file = match &temp_dir {
                Some(dir) => builder.tempfile_in(dir),
                None => builder.tempfile(),
            }
            .map_err(RagError::storage)?;

            file.write_all(&bytes).map_err(RagError::storage)?;
            file.flush().map_err(RagError::storage)?;

            extractor.extract(file.path(), &key)
        })
        .await
        .map_err(|e| RagError::Storage(format!("extraction task failed: {}", e)))?
    }
}
