//! Text-generation service contract and the local Ollama client
//!
//! The model itself is an external collaborator. [`GenerationService`]
//! covers the three ways the pipeline uses it: one-shot generation (chunk
//! summaries, query rewrites, history summaries), token-streamed chat, and
//! model metadata (context length, availability).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::pin::Pin;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::error::{Result, SkemaError};

/// Default address of a local Ollama instance.
pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Token budget assumed when the model does not report one.
pub const DEFAULT_CONTEXT_LENGTH: usize = 4096;

/// Who said a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// One turn of a conversation. Ordered and append-only; conversation state
/// lives in the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Boxed token stream; the stream ends after the final token or error.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Contract for the text-generation collaborator.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Non-streaming generation, used for summarization and query rewrite.
    async fn generate(&self, prompt: &str, system: &str) -> Result<String>;

    /// Streaming chat completion over the given history.
    fn chat_stream(&self, system: &str, messages: Vec<ChatMessage>) -> TokenStream;

    /// The model's token budget.
    async fn context_length(&self) -> Result<usize>;

    /// Whether the service answers at all.
    async fn is_available(&self) -> bool;

    /// Whether the configured model is present on the service.
    async fn has_model(&self) -> Result<bool>;
}

/// Generation client for a local Ollama instance.
pub struct OllamaGenerator {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
    fallback_context_length: usize,
}

impl OllamaGenerator {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        temperature: f32,
        fallback_context_length: usize,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            temperature,
            fallback_context_length,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Classify a transport error at the call site: connection failures become
/// [`SkemaError::Unreachable`], everything else surfaces as upstream trouble.
pub(crate) fn map_transport_error(service: &str, base_url: &str, e: reqwest::Error) -> SkemaError {
    if e.is_connect() || e.is_timeout() {
        SkemaError::Unreachable {
            service: service.to_string(),
            detail: base_url.to_string(),
        }
    } else {
        SkemaError::Upstream {
            service: service.to_string(),
            detail: e.to_string(),
        }
    }
}

pub(crate) async fn reject_error_status(
    service: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(SkemaError::Upstream {
        service: service.to_string(),
        detail: format!("HTTP {}: {}", status, body),
    })
}

const SERVICE: &str = "ollama";

#[async_trait]
impl GenerationService for OllamaGenerator {
    async fn generate(&self, prompt: &str, system: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "system": system,
            "stream": false,
            "options": { "temperature": self.temperature },
        });

        debug!("Generating with model {}", self.model);

        let response = self
            .client
            .post(self.endpoint("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(SERVICE, &self.base_url, e))?;
        let response = reject_error_status(SERVICE, response).await?;

        let parsed: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| SkemaError::MalformedResponse {
                    service: SERVICE.to_string(),
                    detail: e.to_string(),
                })?;

        parsed["response"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| SkemaError::MalformedResponse {
                service: SERVICE.to_string(),
                detail: "missing 'response' field".to_string(),
            })
    }

    fn chat_stream(&self, system: &str, messages: Vec<ChatMessage>) -> TokenStream {
        let client = self.client.clone();
        let url = self.endpoint("/api/chat");
        let base_url = self.base_url.clone();
        let model = self.model.clone();
        let temperature = self.temperature;

        let mut api_messages = vec![json!({"role": "system", "content": system})];
        api_messages.extend(
            messages
                .iter()
                .map(|m| json!({"role": m.role.as_str(), "content": m.content})),
        );

        Box::pin(async_stream::stream! {
            let body = json!({
                "model": model,
                "messages": api_messages,
                "stream": true,
                "options": { "temperature": temperature },
            });

            debug!("Streaming chat with model {}", model);

            let response = match client.post(&url).json(&body).send().await {
                Ok(r) => r,
                Err(e) => {
                    yield Err(map_transport_error(SERVICE, &base_url, e));
                    return;
                }
            };
            let response = match reject_error_status(SERVICE, response).await {
                Ok(r) => r,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        yield Err(SkemaError::Upstream {
                            service: SERVICE.to_string(),
                            detail: format!("stream read error: {}", e),
                        });
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // Ollama streams newline-delimited JSON objects
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if line.is_empty() {
                        continue;
                    }

                    let parsed: serde_json::Value = match serde_json::from_str(&line) {
                        Ok(v) => v,
                        Err(e) => {
                            yield Err(SkemaError::MalformedResponse {
                                service: SERVICE.to_string(),
                                detail: format!("bad stream line: {}", e),
                            });
                            return;
                        }
                    };

                    if let Some(err) = parsed["error"].as_str() {
                        yield Err(SkemaError::Upstream {
                            service: SERVICE.to_string(),
                            detail: err.to_string(),
                        });
                        return;
                    }

                    if let Some(token) = parsed["message"]["content"].as_str() {
                        if !token.is_empty() {
                            yield Ok(token.to_string());
                        }
                    }

                    if parsed["done"].as_bool() == Some(true) {
                        return;
                    }
                }
            }
        })
    }

    async fn context_length(&self) -> Result<usize> {
        let response = self
            .client
            .post(self.endpoint("/api/show"))
            .json(&json!({ "model": self.model }))
            .send()
            .await
            .map_err(|e| map_transport_error(SERVICE, &self.base_url, e))?;
        let response = reject_error_status(SERVICE, response).await?;

        let parsed: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| SkemaError::MalformedResponse {
                    service: SERVICE.to_string(),
                    detail: e.to_string(),
                })?;

        // model_info keys are architecture-prefixed, e.g. "llama.context_length"
        let reported = parsed["model_info"].as_object().and_then(|info| {
            info.iter()
                .find(|(key, _)| key.ends_with(".context_length"))
                .and_then(|(_, value)| value.as_u64())
        });

        Ok(reported
            .map(|n| n as usize)
            .unwrap_or(self.fallback_context_length))
    }

    async fn is_available(&self) -> bool {
        self.client
            .get(self.endpoint("/api/tags"))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn has_model(&self) -> Result<bool> {
        let response = self
            .client
            .get(self.endpoint("/api/tags"))
            .send()
            .await
            .map_err(|e| map_transport_error(SERVICE, &self.base_url, e))?;
        let response = reject_error_status(SERVICE, response).await?;

        let parsed: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| SkemaError::MalformedResponse {
                    service: SERVICE.to_string(),
                    detail: e.to_string(),
                })?;

        let models = parsed["models"]
            .as_array()
            .ok_or_else(|| SkemaError::MalformedResponse {
                service: SERVICE.to_string(),
                detail: "missing 'models' field".to_string(),
            })?;

        Ok(models.iter().any(|m| {
            m["name"].as_str().is_some_and(|name| {
                name == self.model || name.split(':').next() == Some(self.model.as_str())
            })
        }))
    }
}
