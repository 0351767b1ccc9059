use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::sse::{self, Frame};
use super::{LlmProvider, Timeouts};
use crate::error::{RagError, RagResult};
use crate::models::{Message, ProviderKind};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(rename = "type", default)]
    delta_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
    timeouts: Timeouts,
    temperature: f32,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(
        base_url: String,
        api_key: String,
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

    async fn send(&self, prompt: &str, model: &str, stream: bool) -> RagResult<reqwest::Response> {
        let body = MessagesRequest {
            model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            stream,
        };

        let mut req = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if !stream {
            req = req.timeout(self.timeouts.request);
        }
        let response = req.send().await.map_err(RagError::provider)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(RagError::Provider(format!(
                "Anthropic request failed: {} - {}",
                status, error_text
            )));
        }
        Ok(response)
    }
}

fn parse_message(body: &str) -> RagResult<String> {
    let response: MessagesResponse = serde_json::from_str(body)
        .map_err(|e| RagError::Provider(format!("malformed Anthropic response: {}", e)))?;
    let text: String = response
        .content
        .into_iter()
        .filter(|block| block.block_type == "text")
        .filter_map(|block| block.text)
        .collect();
    Ok(text)
}

fn parse_stream_frame(payload: &str) -> RagResult<Frame> {
    let event: StreamEvent = serde_json::from_str(payload)
        .map_err(|e| RagError::Provider(format!("malformed Anthropic stream event: {}", e)))?;

    match event.event_type.as_str() {
        "content_block_delta" => Ok(event
            .delta
            .filter(|d| d.delta_type.as_deref().unwrap_or("text_delta") == "text_delta")
            .and_then(|d| d.text)
            .map(Frame::Text)
            .unwrap_or(Frame::Skip)),
        "message_stop" => Ok(Frame::Done),
        "error" => Err(RagError::Provider(format!(
            "Anthropic stream error: {}",
            event.error.unwrap_or_default()
        ))),
        _ => Ok(Frame::Skip),
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn generate(&self, prompt: &str, model: &str) -> RagResult<String> {
        let response = self.send(prompt, model, false).await?;
        let body = response.text().await.map_err(RagError::provider)?;
        parse_message(&body)
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        model: &str,
    ) -> RagResult<BoxStream<'static, RagResult<String>>> {
        let response = self.send(prompt, model, true).await?;
        Ok(sse::decode(
            response.bytes_stream(),
            parse_stream_frame,
            true,
            Some(self.timeouts.stream_idle),
        ))
    }
}
