//! Layered configuration.
//!
//! Sources, later ones winning:
//!
//! 1. built-in defaults (the `Default` impls below)
//! 2. `config/default.toml`, if present
//! 3. the file named by `RAG_CONFIG`, if set
//! 4. `RAG__SECTION__KEY` environment variables
//! 5. the conventional `DATABASE_URL`, `QDRANT_URL`, `OPENAI_API_KEY` and
//!    `ANTHROPIC_API_KEY` variables
//!
//! Credentials only ever come from files or the environment.

use std::path::PathBuf;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::error::{RagError, RagResult};
use crate::models::Metric;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub storage: StorageSettings,
    pub embedding: EmbeddingSettings,
    pub vector_index: VectorIndexSettings,
    pub chunking: ChunkingSettings,
    pub retrieval: RetrievalSettings,
    pub llm: LlmSettings,
    pub ingest: IngestSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub max_upload_bytes: usize,
    pub keep_alive_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_upload_bytes: 20 * 1024 * 1024,
            keep_alive_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Without a URL the catalog lives in memory.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub root_dir: PathBuf,
    /// Where temporary copies of documents are written during ingestion.
    pub temp_dir: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./data/objects"),
            temp_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    OpenAI,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub provider: EmbeddingBackend,
    pub model: String,
    pub dims: usize,
    pub api_key: Option<String>,
    pub base_url: String,
    /// Model directory for the local ONNX backend.
    pub model_dir: PathBuf,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub batch_size: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: EmbeddingBackend::OpenAI,
            model: "text-embedding-ada-002".to_string(),
            dims: 1536,
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model_dir: PathBuf::from("/app/models/bge-small-en-v1.5"),
            timeout_secs: 30,
            max_retries: 3,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    Qdrant,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VectorIndexSettings {
    pub backend: IndexBackend,
    pub url: String,
    pub api_key: Option<String>,
    pub collection: String,
    pub dimension: usize,
    pub metric: Metric,
}

impl Default for VectorIndexSettings {
    fn default() -> Self {
        Self {
            backend: IndexBackend::Qdrant,
            url: "http://localhost:6334".to_string(),
            api_key: None,
            collection: "ai-insights".to_string(),
            dimension: 1536,
            metric: Metric::Cosine,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub top_k: usize,
    /// Matches scoring below this are dropped from the context.
    pub min_score: Option<f32>,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub default_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Whole-request limit for non-streaming completions.
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Longest gap between two reads of a streaming response.
    pub stream_idle_timeout_secs: u64,
    pub openai: ProviderSettings,
    pub anthropic: ProviderSettings,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            default_model: "gpt-3.5-turbo".to_string(),
            temperature: 0.7,
            max_tokens: 1024,
            timeout_secs: 120,
            connect_timeout_secs: 10,
            stream_idle_timeout_secs: 60,
            openai: ProviderSettings::default(),
            anthropic: ProviderSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub queue_capacity: usize,
    /// Finished jobs kept for status lookups; the oldest are dropped first.
    pub retained_jobs: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            retained_jobs: 1000,
        }
    }
}

impl Settings {
    /// Load settings from files and the process environment.
    pub fn load() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let mut builder = Config::builder()
            .add_source(File::with_name("config/default").required(false));
        if let Ok(path) = std::env::var("RAG_CONFIG") {
            builder = builder.add_source(File::with_name(&path).required(true));
        }
        builder = builder
            .add_source(
                Environment::with_prefix("RAG")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?
            .set_override_option("vector_index.url", std::env::var("QDRANT_URL").ok())?
            .set_override_option("embedding.api_key", std::env::var("OPENAI_API_KEY").ok())?
            .set_override_option("llm.openai.api_key", std::env::var("OPENAI_API_KEY").ok())?
            .set_override_option(
                "llm.anthropic.api_key",
                std::env::var("ANTHROPIC_API_KEY").ok(),
            )?;

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML document on top of the defaults.
    pub fn from_toml(toml: &str) -> anyhow::Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> RagResult<()> {
        let chunking = &self.chunking;
        if chunking.chunk_size == 0 {
            return Err(RagError::Configuration("chunking.chunk_size must be positive".into()));
        }
        if chunking.chunk_overlap == 0 {
            return Err(RagError::Configuration("chunking.chunk_overlap must be positive".into()));
        }
        if chunking.chunk_overlap >= chunking.chunk_size {
            return Err(RagError::Configuration(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
                chunking.chunk_overlap, chunking.chunk_size
            )));
        }
        if self.retrieval.top_k == 0 {
            return Err(RagError::Configuration("retrieval.top_k must be positive".into()));
        }
        if self.embedding.batch_size == 0 {
            return Err(RagError::Configuration("embedding.batch_size must be positive".into()));
        }
        if self.ingest.retained_jobs == 0 {
            return Err(RagError::Configuration("ingest.retained_jobs must be positive".into()));
        }
        if self.embedding.dims != self.vector_index.dimension {
            return Err(RagError::Configuration(format!(
                "embedding.dims ({}) does not match vector_index.dimension ({})",
                self.embedding.dims, self.vector_index.dimension
            )));
        }
        Ok(())
    }
}
