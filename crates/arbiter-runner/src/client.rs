//! OpenAI-compatible chat-completions backend

use std::time::Duration;

use arbitration::{ModelCallError, ModelClient, ModelReply, ModelRequest};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RunnerConfig;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Pull the first choice's content out of a chat-completions body
pub fn parse_chat_response(body: &str) -> Result<ModelReply, ModelCallError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| ModelCallError::Malformed(format!("invalid response body: {e}")))?;

    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| ModelCallError::Malformed("no content in response".to_string()))?;

    Ok(ModelReply::text(content))
}

/// Classify a non-success HTTP status
pub fn status_error(status: StatusCode, body: &str) -> ModelCallError {
    let message = format!("HTTP {}: {}", status, truncate(body, 300));
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ModelCallError::Transient(message)
    } else {
        ModelCallError::Permanent(message)
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// [`ModelClient`] over any OpenAI-compatible `/chat/completions` endpoint
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    config: RunnerConfig,
}

impl OpenAiCompatClient {
    pub fn new(config: RunnerConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    async fn invoke(
        &self,
        request: &ModelRequest,
        timeout: Duration,
    ) -> Result<ModelReply, ModelCallError> {
        let body = ChatRequest {
            model: &request.model_id,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_prompt,
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: request.temperature,
        };

        let mut builder = self
            .http
            .post(self.config.completions_url())
            .timeout(timeout)
            .json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ModelCallError::Timeout(timeout)
            } else {
                ModelCallError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ModelCallError::Timeout(timeout)
            } else {
                ModelCallError::Transient(e.to_string())
            }
        })?;

        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        debug!(model_id = %request.model_id, bytes = text.len(), "Model replied");
        parse_chat_response(&text)
    }
}
