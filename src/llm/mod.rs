pub mod anthropic;
pub mod openai;
pub mod sse;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

use crate::error::{RagError, RagResult};
use crate::models::{ModelInfo, ProviderKind};
use crate::settings::LlmSettings;

use self::anthropic::AnthropicProvider;
use self::openai::OpenAIProvider;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

/// Text generation backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn generate(&self, prompt: &str, model: &str) -> RagResult<String>;

    /// Fragments in generation order. A failure part-way through is the
    /// last item of the stream.
    async fn generate_stream(
        &self,
        prompt: &str,
        model: &str,
    ) -> RagResult<BoxStream<'static, RagResult<String>>>;
}

struct ModelSpec {
    id: &'static str,
    name: &'static str,
    provider: ProviderKind,
    description: &'static str,
}

static MODELS: Lazy<Vec<ModelSpec>> = Lazy::new(|| {
    vec![
        ModelSpec {
            id: "claude-3-5-sonnet-20241022",
            name: "Claude 3.5 Sonnet",
            provider: ProviderKind::Anthropic,
            description: "最新のClaude 3.5 Sonnet - 高性能バランス型",
        },
        ModelSpec {
            id: "claude-3-opus-20240229",
            name: "Claude 3 Opus",
            provider: ProviderKind::Anthropic,
            description: "最も高性能なClaudeモデル",
        },
        ModelSpec {
            id: "claude-3-haiku-20240307",
            name: "Claude 3 Haiku",
            provider: ProviderKind::Anthropic,
            description: "高速・低コストなClaudeモデル",
        },
        ModelSpec {
            id: "gpt-4-turbo-preview",
            name: "GPT-4 Turbo",
            provider: ProviderKind::OpenAI,
            description: "最新のGPT-4",
        },
        ModelSpec {
            id: "gpt-4",
            name: "GPT-4",
            provider: ProviderKind::OpenAI,
            description: "標準GPT-4",
        },
        ModelSpec {
            id: "gpt-3.5-turbo",
            name: "GPT-3.5 Turbo",
            provider: ProviderKind::OpenAI,
            description: "高速・低コストなGPTモデル",
        },
    ]
});

// cl100k is close enough for every catalog model
static TOKENIZER: Lazy<Option<CoreBPE>> = Lazy::new(|| tiktoken_rs::cl100k_base().ok());

/// Approximate token count, falling back to a 4-chars-per-token guess.
pub fn estimate_tokens(text: &str) -> usize {
    match TOKENIZER.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

/// HTTP limits shared by the providers. Streaming responses have no total
/// deadline; they fail once no bytes arrive for `stream_idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub request: Duration,
    pub stream_idle: Duration,
}

impl Timeouts {
    pub fn from_settings(settings: &LlmSettings) -> Self {
        Self {
            connect: Duration::from_secs(settings.connect_timeout_secs),
            request: Duration::from_secs(settings.timeout_secs),
            stream_idle: Duration::from_secs(settings.stream_idle_timeout_secs),
        }
    }
}

#[derive(Debug)]
pub struct ResolvedModel {
    pub id: String,
    pub provider: ProviderKind,
}

#[derive(Debug, Clone)]
pub struct GenerationMeta {
    pub model: String,
    pub provider: ProviderKind,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Picks a provider per model and tracks model usage.
pub struct Generator {
    providers: HashMap<ProviderKind, Arc<dyn LlmProvider>>,
    default_model: String,
    last_used: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl Generator {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_model: default_model.into(),
            last_used: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    /// Register every provider that has credentials (or, for the
    /// OpenAI-compatible one, an explicit gateway URL).
    pub fn from_settings(settings: &LlmSettings) -> RagResult<Self> {
        let timeouts = Timeouts::from_settings(settings);
        let mut generator = Self::new(settings.default_model.clone());

        let openai = &settings.openai;
        if openai.api_key.is_some() || openai.base_url.is_some() {
            let provider = OpenAIProvider::new(
                openai.base_url.clone().unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
                openai.api_key.clone(),
                timeouts,
                settings.temperature,
                settings.max_tokens,
            )?;
            generator = generator.with_provider(Arc::new(provider));
        }

        if let Some(api_key) = settings.anthropic.api_key.clone() {
            let provider = AnthropicProvider::new(
                settings
                    .anthropic
                    .base_url
                    .clone()
                    .unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string()),
                api_key,
                timeouts,
                settings.temperature,
                settings.max_tokens,
            )?;
            generator = generator.with_provider(Arc::new(provider));
        }

        if generator.providers.is_empty() {
            tracing::warn!("no LLM provider configured; queries will fail until credentials are set");
        }
        Ok(generator)
    }

    /// Map a requested model to a catalog entry. Unknown or missing names
    /// fall back to the default model.
    pub fn resolve(&self, requested: Option<&str>) -> RagResult<ResolvedModel> {
        let requested = requested.map(str::trim).filter(|m| !m.is_empty());
        let spec = match requested {
            Some(name) => match find_model(name) {
                Some(spec) => spec,
                None => {
                    tracing::warn!(
                        requested = %name,
                        fallback = %self.default_model,
                        "unknown model, falling back to default"
                    );
                    self.default_spec()?
                }
            },
            None => self.default_spec()?,
        };

        if !self.providers.contains_key(&spec.provider) {
            return Err(RagError::Configuration(format!(
                "model {} needs the {} provider, which is not configured",
                spec.id, spec.provider
            )));
        }

        Ok(ResolvedModel {
            id: spec.id.to_string(),
            provider: spec.provider,
        })
    }

    fn default_spec(&self) -> RagResult<&'static ModelSpec> {
        find_model(&self.default_model).ok_or_else(|| {
            RagError::Configuration(format!(
                "default model {} is not in the model catalog",
                self.default_model
            ))
        })
    }

    fn provider(&self, kind: ProviderKind) -> RagResult<&Arc<dyn LlmProvider>> {
        self.providers
            .get(&kind)
            .ok_or_else(|| RagError::Configuration(format!("{} provider is not configured", kind)))
    }

    pub async fn generate(
        &self,
        prompt: &str,
        model: &ResolvedModel,
    ) -> RagResult<(String, GenerationMeta)> {
        let started_at = Utc::now();
        let text = self.provider(model.provider)?.generate(prompt, &model.id).await?;
        let finished_at = Utc::now();
        self.mark_used(&model.id, finished_at);

        let meta = GenerationMeta {
            model: model.id.clone(),
            provider: model.provider,
            prompt_tokens: estimate_tokens(prompt),
            completion_tokens: estimate_tokens(&text),
            started_at,
            finished_at,
        };
        Ok((text, meta))
    }

    pub async fn generate_stream(
        &self,
        prompt: &str,
        model: &ResolvedModel,
    ) -> RagResult<BoxStream<'static, RagResult<String>>> {
        let stream = self
            .provider(model.provider)?
            .generate_stream(prompt, &model.id)
            .await?;
        self.mark_used(&model.id, Utc::now());
        Ok(stream)
    }

    fn mark_used(&self, model: &str, at: DateTime<Utc>) {
        if let Ok(mut last_used) = self.last_used.write() {
            last_used.insert(model.to_string(), at);
        }
    }

    /// The model catalog, with last use times.
    pub fn models(&self) -> Vec<ModelInfo> {
        let last_used = self.last_used.read().map(|m| m.clone()).unwrap_or_default();
        MODELS
            .iter()
            .map(|spec| ModelInfo {
                id: spec.id.to_string(),
                name: spec.name.to_string(),
                provider: spec.provider,
                description: spec.description.to_string(),
                last_used_at: last_used.get(spec.id).copied(),
            })
            .collect()
    }

    pub fn configured_providers(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|k| k.to_string());
        kinds
    }
}

fn find_model(name: &str) -> Option<&'static ModelSpec> {
    MODELS.iter().find(|spec| spec.id == name)
}
