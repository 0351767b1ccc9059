use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::Client;

use super::sse::{self, Frame};
use super::{LlmProvider, Timeouts};
use crate::error::{RagError, RagResult};
use crate::models::{ChatRequest, ChatResponse, Message, ProviderKind, StreamChunk};

/// OpenAI-compatible `/chat/completions` client. Also talks to LiteLLM and
/// other gateways that speak the same protocol.
pub struct OpenAIProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeouts: Timeouts,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAIProvider {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        timeouts: Timeouts,
        temperature: f32,
        max_tokens: u32,
    ) -> RagResult<Self> {
        let client = Client::builder()
            .connect_timeout(timeouts.connect)
            .build()
            .map_err(|e| RagError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeouts,
            temperature,
            max_tokens,
        })
    }

    fn request(&self, prompt: &str, model: &str, stream: bool) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            stream,
        }
    }

    async fn send(&self, request: &ChatRequest) -> RagResult<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut req = self.client.post(&url).json(request);
        if !request.stream {
            req = req.timeout(self.timeouts.request);
        }
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(RagError::provider)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(RagError::Provider(format!(
                "chat completion failed: {} - {}",
                status, error_text
            )));
        }
        Ok(response)
    }
}

pub(crate) fn parse_completion(body: &str) -> RagResult<String> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| RagError::Provider(format!("malformed chat completion: {}", e)))?;
    response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
        .ok_or_else(|| RagError::Provider("chat completion has no choices".to_string()))
}

pub(crate) fn parse_stream_frame(payload: &str) -> RagResult<Frame> {
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Ok(Frame::Done);
    }
    if payload.is_empty() {
        return Ok(Frame::Skip);
    }

    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| RagError::Provider(format!("malformed stream chunk: {}", e)))?;
    if let Some(error) = value.get("error") {
        return Err(RagError::Provider(format!("provider stream error: {}", error)));
    }

    let chunk: StreamChunk = serde_json::from_value(value)
        .map_err(|e| RagError::Provider(format!("malformed stream chunk: {}", e)))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .map(Frame::Text)
        .unwrap_or(Frame::Skip))
}

#[async_trait]
impl LlmProvider for OpenAIProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    async fn generate(&self, prompt: &str, model: &str) -> RagResult<String> {
        let response = self.send(&self.request(prompt, model, false)).await?;
        let body = response.text().await.map_err(RagError::provider)?;
        parse_completion(&body)
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        model: &str,
    ) -> RagResult<BoxStream<'static, RagResult<String>>> {
        let response = self.send(&self.request(prompt, model, true)).await?;
        Ok(sse::decode(
            response.bytes_stream(),
            parse_stream_frame,
            true,
            Some(self.timeouts.stream_idle),
        ))
    }
}
