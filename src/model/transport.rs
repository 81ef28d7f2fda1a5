//! Completion transport: one OpenAI-compatible chat request per attempt.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::pool::ModelPoolEntry;

/// Transport errors, typed so the orchestrator does not have to pattern-match
/// strings for failures that originate inside this crate.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request aborted")]
    Aborted,
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("Failed to parse completion: {0}")]
    Parse(String),
}

/// Sampling parameters sent with every completion request.
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for RequestParams {
    fn default() -> Self {
        Self {
            max_tokens: 3000,
            temperature: 0.0,
            top_p: 0.85,
        }
    }
}

/// One completion call against one pool entry. Implementations must honor the
/// cancellation token while the request is pending.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    async fn complete(
        &self,
        entry: &ModelPoolEntry,
        messages: &[Value],
        cancel: &CancellationToken,
    ) -> Result<String, TransportError>;
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: String,
}

/// Reqwest-backed transport for OpenAI-compatible `/chat/completions`
/// endpoints.
pub struct HttpTransport {
    client: Client,
    params: RequestParams,
}

impl HttpTransport {
    pub fn new(params: RequestParams) -> Self {
        Self {
            client: Client::new(),
            params,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RequestParams::default())
    }

    async fn send_request(
        &self,
        entry: &ModelPoolEntry,
        messages: &[Value],
    ) -> Result<String, TransportError> {
        let url = format!("{}/chat/completions", entry.base_url.trim_end_matches('/'));
        let body = json!({
            "messages": messages,
            "model": entry.model,
            "max_tokens": self.params.max_tokens,
            "temperature": self.params.temperature,
            "top_p": self.params.top_p,
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", entry.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Parse(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| TransportError::Parse("no choices in response".to_string()))
    }
}

#[async_trait]
impl CompletionTransport for HttpTransport {
    async fn complete(
        &self,
        entry: &ModelPoolEntry,
        messages: &[Value],
        cancel: &CancellationToken,
    ) -> Result<String, TransportError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Aborted),
            result = self.send_request(entry, messages) => result,
        }
    }
}

/// Helpers for building conversation messages.
pub struct MessageBuilder;

impl MessageBuilder {
    /// Create a system message.
    pub fn system(content: &str) -> Value {
        json!({
            "role": "system",
            "content": content
        })
    }

    /// Create a user message with an optional base64 PNG screenshot.
    pub fn user(text: &str, image_base64: Option<&str>) -> Value {
        let mut content = Vec::new();

        if let Some(img_data) = image_base64 {
            content.push(json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:image/png;base64,{}", img_data)
                }
            }));
        }

        content.push(json!({
            "type": "text",
            "text": text
        }));

        json!({
            "role": "user",
            "content": content
        })
    }
}
