use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::error::{RagError, RagResult};

static NAMESPACE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").unwrap());

/// Vector index partition owned by exactly one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    pub fn for_workspace(workspace_id: &str) -> RagResult<Self> {
        let id = workspace_id.trim();
        if !NAMESPACE_PATTERN.is_match(id) || id.contains("..") {
            return Err(RagError::InvalidInput(format!(
                "invalid workspace id: {:?}",
                workspace_id
            )));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    Dot,
    Euclid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub text: String,
    pub source: String,
    pub workspace: String,
    pub chunk_index: usize,
    pub content_hash: String,
}

/// Embedding of exactly one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: RecordMetadata,
}

impl VectorRecord {
    /// Stable id so that re-ingesting a document overwrites its vectors.
    pub fn record_id(document_key: &str, chunk_index: usize) -> String {
        format!("{}-chunk-{}", document_key, chunk_index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub id: String,
    pub text: String,
    pub score: f32,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceScore {
    pub source: String,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PromptTemplate {
    pub id: Uuid,
    pub workspace_id: String,
    pub name: String,
    pub llm_model: Option<String>,
    pub main_instructions: Option<String>,
    pub business_description: Option<String>,
    pub customer_profile: Option<String>,
    pub rules_and_filters: Option<String>,
    pub example_outputs: Option<String>,
    pub guidance_override: Option<String>,
    /// Raw prompt; when present it replaces the structured build.
    pub prompt: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl PromptTemplate {
    /// Template used for raw-prompt queries.
    pub fn assistant_default() -> Self {
        Self {
            name: "assistant".to_string(),
            main_instructions: Some(
                "You are a helpful assistant that answers questions based on the provided context. \
                 Use the context to provide accurate and relevant answers."
                    .to_string(),
            ),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DocumentRecord {
    pub workspace_id: String,
    pub file_path: String,
    pub filename: String,
    pub file_size: i64,
    pub content_type: Option<String>,
    pub chunk_count: Option<i32>,
    pub indexed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub name: String,
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

// LLM wire types (OpenAI-compatible)

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamChunk {
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Delta {
    pub role: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenAI => f.write_str("openai"),
            ProviderKind::Anthropic => f.write_str("anthropic"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

// Query surface

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub template_id: Option<Uuid>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub user_input: Option<String>,
    #[serde(default)]
    pub additional_context: Map<String, Value>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryMetadata {
    pub model: String,
    pub provider: ProviderKind,
    pub sources: Vec<SourceScore>,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub id: String,
    pub result: String,
    pub metadata: QueryMetadata,
}

/// One unit of a streamed answer. Every stream is
/// `start, chunk*, (end | error)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueryEvent {
    Start { id: String },
    Chunk { id: String, content: String },
    End { id: String },
    Error { id: String, message: String },
}

impl QueryEvent {
    pub fn id(&self) -> &str {
        match self {
            QueryEvent::Start { id }
            | QueryEvent::Chunk { id, .. }
            | QueryEvent::End { id }
            | QueryEvent::Error { id, .. } => id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryEvent::End { .. } | QueryEvent::Error { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueryEvent::Start { .. } => "start",
            QueryEvent::Chunk { .. } => "chunk",
            QueryEvent::End { .. } => "end",
            QueryEvent::Error { .. } => "error",
        }
    }
}

// Upload / ingestion surface

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessFileRequest {
    pub file_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResponse {
    pub filename: String,
    pub key: String,
    pub workspace_id: String,
    pub job_id: Uuid,
    pub processing_status: String,
    pub metadata_saved: bool,
}
