//! Embedding provider trait and the OpenAI-compatible HTTP client.
//!
//! The chunk+embed stage and the retrieval engine both go through
//! `EmbeddingProvider`, so tests can swap in a deterministic fake.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Provider returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },

    #[error("Rate limited after {retries} retries")]
    RateLimited { retries: u32 },
}

/// Vectors for a batch of inputs, in input order, plus the tokens billed.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingBatch {
    pub vectors: Vec<Vec<f32>>,
    pub prompt_tokens: u32,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, EmbeddingError>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    usage: EmbeddingUsage,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingUsage {
    prompt_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// Calls an OpenAI-compatible `/v1/embeddings` endpoint.
/// Retries 429 and 5xx responses with exponential backoff.
#[derive(Clone)]
pub struct OpenAiEmbeddingClient {
    client: Client,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbeddingClient {
    pub fn new(api_key: String, model: String, dims: usize) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .expect("Failed to build HTTP client"),
            api_key,
            model,
            dims,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, EmbeddingError> {
        if texts.is_empty() {
            return Ok(EmbeddingBatch::default());
        }

        let request_body = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.dims,
        };

        let mut last_error: Option<EmbeddingError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s
                let delay = std::time::Duration::from_millis(1000 * (1 << (attempt - 1)));
                warn!(
                    "Embedding call attempt {} failed, retrying after {}ms...",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = match self
                .client
                .post(OPENAI_EMBEDDINGS_URL)
                .bearer_auth(&self.api_key)
                .json(&request_body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(EmbeddingError::Http(e));
                    continue;
                }
            };

            let status = response.status();

            if status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                warn!("Embeddings API returned {}: {}", status, body);
                last_error = Some(EmbeddingError::Api {
                    status: status.as_u16(),
                    message: body,
                });
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<ApiError>(&body)
                    .map(|e| e.error.message)
                    .unwrap_or(body);
                return Err(EmbeddingError::Api {
                    status: status.as_u16(),
                    message,
                });
            }

            let mut parsed: EmbeddingResponse = response.json().await?;
            if parsed.data.len() != texts.len() {
                return Err(EmbeddingError::CountMismatch {
                    expected: texts.len(),
                    got: parsed.data.len(),
                });
            }
            parsed.data.sort_by_key(|d| d.index);

            debug!(
                "Embedded {} inputs with {} ({} tokens)",
                texts.len(),
                self.model,
                parsed.usage.prompt_tokens
            );

            return Ok(EmbeddingBatch {
                vectors: parsed.data.into_iter().map(|d| d.embedding).collect(),
                prompt_tokens: parsed.usage.prompt_tokens,
            });
        }

        Err(last_error.unwrap_or(EmbeddingError::RateLimited {
            retries: MAX_RETRIES,
        }))
    }
}

#[cfg(test)]
pub mod fake {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Deterministic embedder: known texts map to fixed vectors, anything else
    /// gets `[len, 1, 0, ..]`. Counts calls so tests can check cost accounting.
    pub struct FakeEmbedder {
        dims: usize,
        known: HashMap<String, Vec<f32>>,
        down: bool,
        pub calls: AtomicUsize,
    }

    impl FakeEmbedder {
        pub fn new(dims: usize) -> Self {
            Self {
                dims,
                known: HashMap::new(),
                down: false,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn unavailable(dims: usize) -> Self {
            Self {
                down: true,
                ..Self::new(dims)
            }
        }

        pub fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
            self.known.insert(text.to_string(), vector);
            self
        }

        fn vector_for(&self, text: &str) -> Vec<f32> {
            self.known.get(text).cloned().unwrap_or_else(|| {
                let mut v = vec![0.0; self.dims];
                if let Some(first) = v.first_mut() {
                    *first = text.len() as f32;
                }
                if let Some(second) = v.get_mut(1) {
                    *second = 1.0;
                }
                v
            })
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FakeEmbedder {
        fn model_name(&self) -> &str {
            "fake-embedder"
        }

        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down {
                return Err(EmbeddingError::Api {
                    status: 503,
                    message: "provider overloaded".to_string(),
                });
            }
            Ok(EmbeddingBatch {
                vectors: texts.iter().map(|t| self.vector_for(t)).collect(),
                prompt_tokens: texts.iter().map(|t| t.split_whitespace().count() as u32).sum(),
            })
        }
    }
}
