#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tempfile::TempDir;
use uuid::Uuid;

use workspace_rag::catalog::MemoryCatalog;
use workspace_rag::error::{RagError, RagResult};
use workspace_rag::indexer::extractor::PlainTextExtractor;
use workspace_rag::llm::{Generator, LlmProvider};
use workspace_rag::models::{Metric, Namespace, ProviderKind};
use workspace_rag::rag::embeddings::Embedder;
use workspace_rag::rag::jobs::{IngestJob, IngestQueue, JobStatus};
use workspace_rag::rag::memory_index::InMemoryIndex;
use workspace_rag::rag::pipeline::{IngestPipeline, PipelineSettings};
use workspace_rag::rag::query::QueryService;
use workspace_rag::rag::retrieval::Retriever;
use workspace_rag::settings::{ChunkingSettings, IngestSettings};
use workspace_rag::storage::{MemoryObjectStore, ObjectStore};

pub const DIMS: usize = 16;

/// Bag-of-words embedder: each lowercase word is hashed into a bucket.
/// Identical texts get identical vectors; shared words raise similarity.
pub struct HashEmbedder {
    dims: usize,
    pub calls: AtomicUsize,
    fail_next: AtomicUsize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            calls: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
        }
    }

    /// The first `n` batches fail with a transient provider error.
    pub fn failing(dims: usize, n: usize) -> Self {
        Self {
            fail_next: AtomicUsize::new(n),
            ..Self::new(dims)
        }
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            v[(hasher.finish() % self.dims as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-embedder"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(RagError::Provider("embedding service returned 503".to_string()));
        }
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

/// Provider that replays fixed fragments, optionally failing after
/// `fail_after` of them, and remembers the last prompt it saw. `pulled`
/// counts fragments actually read from the returned streams.
pub struct ScriptedProvider {
    fragments: Vec<String>,
    fail_after: Option<usize>,
    pub last_prompt: Mutex<Option<String>>,
    pub pulled: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            fail_after: None,
            last_prompt: Mutex::new(None),
            pulled: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_after(fragments: &[&str], n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::new(fragments)
        }
    }

    pub fn prompt(&self) -> String {
        self.last_prompt.lock().unwrap().clone().unwrap_or_default()
    }

    pub fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    async fn generate(&self, prompt: &str, _model: &str) -> RagResult<String> {
        *self.last_prompt.lock().unwrap() = Some(prompt.to_string());
        if self.fail_after.is_some() {
            return Err(RagError::Provider("scripted failure".to_string()));
        }
        Ok(self.fragments.concat())
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        _model: &str,
    ) -> RagResult<BoxStream<'static, RagResult<String>>> {
        *self.last_prompt.lock().unwrap() = Some(prompt.to_string());
        let mut items: Vec<RagResult<String>> = Vec::new();
        for (i, fragment) in self.fragments.iter().enumerate() {
            if self.fail_after == Some(i) {
                items.push(Err(RagError::Provider("connection reset".to_string())));
                break;
            }
            items.push(Ok(fragment.clone()));
        }
        let pulled = self.pulled.clone();
        Ok(stream::iter(items)
            .inspect(move |_| {
                pulled.fetch_add(1, Ordering::SeqCst);
            })
            .boxed())
    }
}

pub struct Harness {
    pub store: Arc<MemoryObjectStore>,
    pub catalog: Arc<MemoryCatalog>,
    pub index: Arc<InMemoryIndex>,
    pub embedder: Arc<HashEmbedder>,
    pub pipeline: Arc<IngestPipeline>,
    pub temp_dir: TempDir,
}

pub fn harness(chunk_size: usize, chunk_overlap: usize) -> Harness {
    harness_with(Arc::new(HashEmbedder::new(DIMS)), DIMS, chunk_size, chunk_overlap)
}

pub fn harness_with(
    embedder: Arc<HashEmbedder>,
    index_dims: usize,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Harness {
    let store = Arc::new(MemoryObjectStore::new());
    let catalog = Arc::new(MemoryCatalog::new());
    let index = Arc::new(InMemoryIndex::new(index_dims, Metric::Cosine));
    let temp_dir = tempfile::tempdir().unwrap();

    let pipeline = Arc::new(IngestPipeline::new(
        store.clone(),
        Arc::new(PlainTextExtractor),
        embedder.clone(),
        index.clone(),
        catalog.clone(),
        PipelineSettings {
            chunking: ChunkingSettings {
                chunk_size,
                chunk_overlap,
            },
            batch_size: 4,
            temp_dir: Some(temp_dir.path().to_path_buf()),
        },
    ));

    Harness {
        store,
        catalog,
        index,
        embedder,
        pipeline,
        temp_dir,
    }
}

impl Harness {
    pub async fn put(&self, workspace: &str, filename: &str, text: &str) -> String {
        let ns = Namespace::for_workspace(workspace).unwrap();
        self.store
            .put(&ns, filename, text.as_bytes().to_vec())
            .await
            .unwrap()
    }

    pub async fn put_bytes(&self, workspace: &str, filename: &str, bytes: Vec<u8>) -> String {
        let ns = Namespace::for_workspace(workspace).unwrap();
        self.store.put(&ns, filename, bytes).await.unwrap()
    }

    pub fn temp_files(&self) -> usize {
        std::fs::read_dir(self.temp_dir.path()).unwrap().count()
    }

    pub fn generator(&self, provider: Arc<ScriptedProvider>) -> Arc<Generator> {
        Arc::new(Generator::new("gpt-3.5-turbo").with_provider(provider))
    }

    pub fn query_service(&self, provider: Arc<ScriptedProvider>) -> Arc<QueryService> {
        let retriever = Retriever::new(self.embedder.clone(), self.index.clone(), None);
        Arc::new(QueryService::new(
            self.catalog.clone(),
            retriever,
            self.generator(provider),
            5,
        ))
    }
}

pub fn ingest_settings(retained_jobs: usize) -> IngestSettings {
    IngestSettings {
        queue_capacity: 8,
        retained_jobs,
    }
}

/// Poll until the job leaves `pending`/`running`.
pub async fn wait_for_job(queue: &IngestQueue, id: Uuid) -> IngestJob {
    for _ in 0..500 {
        let job = queue.status(id).await.unwrap();
        if matches!(job.status, JobStatus::Done | JobStatus::Failed) {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} did not finish", id);
}

/// Prose with sentence breaks, `n` sentences long.
pub fn long_text(n: usize) -> String {
    (0..n)
        .map(|i| format!("Sentence number {} talks about topic {}. ", i, i % 7))
        .collect()
}
