//! Embedding service contract and the local Ollama client
//!
//! Embedding math is an external concern; this module only defines the
//! seam. Vectors are assumed L2-normalized by the service, so cosine
//! similarity reduces to a dot product everywhere downstream.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use crate::error::{Result, SkemaError};
use crate::llm::{map_transport_error, reject_error_status};

/// Contract for the embedding collaborator.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Embed a single text (e.g. a search query).
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts in one call; results are positional.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Vector dimensionality.
    fn dimension(&self) -> usize;

    /// Model identifier.
    fn model_name(&self) -> &str;
}

const SERVICE: &str = "ollama-embed";

/// Embedding client for a local Ollama instance (`/api/embed`).
pub struct OllamaEmbedder {
    client: Client,
    base_url: String,
    model: String,
    dimension: usize,
}

impl OllamaEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            dimension,
        }
    }
}

#[async_trait]
impl EmbeddingService for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        if vectors.is_empty() {
            return Err(SkemaError::MalformedResponse {
                service: SERVICE.to_string(),
                detail: "empty embedding response".to_string(),
            });
        }
        Ok(vectors.remove(0))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Embedding batch of {} texts", texts.len());

        let url = format!("{}/api/embed", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "input": texts }))
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

        let rows = parsed["embeddings"]
            .as_array()
            .ok_or_else(|| SkemaError::MalformedResponse {
                service: SERVICE.to_string(),
                detail: "missing 'embeddings' field".to_string(),
            })?;

        if rows.len() != texts.len() {
            return Err(SkemaError::MalformedResponse {
                service: SERVICE.to_string(),
                detail: format!(
                    "embedding count mismatch: expected {}, got {}",
                    texts.len(),
                    rows.len()
                ),
            });
        }

        rows.iter()
            .map(|row| {
                row.as_array()
                    .map(|values| {
                        values
                            .iter()
                            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                            .collect::<Vec<f32>>()
                    })
                    .ok_or_else(|| SkemaError::MalformedResponse {
                        service: SERVICE.to_string(),
                        detail: "embedding row is not an array".to_string(),
                    })
            })
            .collect()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
