//! Anthropic Messages API client.

use std::time::Duration;

use async_trait::async_trait;
use llminister_pipeline::WorkerError;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },
    #[error("still rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("response contained no text")]
    EmptyResponse,
}

impl From<LlmError> for WorkerError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Server { status, body } => WorkerError::Http { status, body },
            LlmError::EmptyResponse => WorkerError::InvalidResponse(err.to_string()),
            LlmError::Http(_) | LlmError::RateLimited { .. } => WorkerError::Provider(err.to_string()),
        }
    }
}

/// Text completion, the one thing the workers need from a model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError>;
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub base_url: String,
    /// Total attempts when the API answers 429.
    pub max_attempts: u32,
    /// Wait before retry `n` is `retry_backoff * n`.
    pub retry_backoff: Duration,
}

impl LlmConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 4000,
            base_url: DEFAULT_BASE_URL.to_string(),
            max_attempts: 6,
            retry_backoff: Duration::from_secs(10),
        }
    }
}

pub struct LlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

impl LlmClient {
    pub fn new(mut config: LlmConfig) -> Self {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let url = format!("{}/v1/messages", self.config.base_url);
        let request = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            temperature: 0.0,
            system,
            messages: [Message {
                role: "user",
                content: user,
            }],
        };

        let mut attempt = 1;
        loop {
            debug!(model = %self.config.model, attempt, "sending completion request");
            let resp = self
                .client
                .post(&url)
                .header("x-api-key", &self.config.api_key)
                .header("anthropic-version", API_VERSION)
                .json(&request)
                .send()
                .await?;
            let status = resp.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt >= self.config.max_attempts {
                    return Err(LlmError::RateLimited { attempts: attempt });
                }
                let wait = self.config.retry_backoff * attempt;
                warn!(attempt, wait_ms = wait.as_millis() as u64, "rate limited, backing off");
                tokio::time::sleep(wait).await;
                attempt += 1;
                continue;
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(LlmError::Server {
                    status: status.as_u16(),
                    body,
                });
            }

            let parsed: MessagesResponse = resp.json().await?;
            let text: String = parsed
                .content
                .iter()
                .filter(|b| b.kind == "text")
                .map(|b| b.text.as_str())
                .collect();
            if text.trim().is_empty() {
                return Err(LlmError::EmptyResponse);
            }
            info!(model = %self.config.model, chars = text.len(), "completion received");
            return Ok(text);
        }
    }
}

/// Strip a Markdown code fence (optionally tagged `json`) around model output.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let body = &trimmed[start + 3..];
    let body = body.strip_prefix("json").unwrap_or(body);
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}
