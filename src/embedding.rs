//! Embedding client abstraction and HTTP adapter.
//!
//! A query becomes one fixed-length dense vector. The HTTP adapter speaks an OpenAI-style
//! wire shape, retries transient upstream faults with bounded exponential backoff, fails over
//! between configured credentials when one is rejected, and L2-normalizes every vector before
//! handing it to the retrieval engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::get_config;

/// Maximum retries after a transient failure.
const MAX_RETRIES: u32 = 3;
/// First backoff delay.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Errors raised by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Upstream fault worth retrying (5xx, timeout, network).
    #[error("transient embedding failure: {0}")]
    TransientUpstream(String),
    /// Every configured credential was rejected.
    #[error("embedding credentials rejected")]
    InvalidCredential,
    /// The provider answered with something we cannot use.
    #[error("malformed embedding response: {0}")]
    MalformedUpstreamResponse(String),
    /// The input text was empty after trimming.
    #[error("embedding input must not be empty")]
    EmptyInput,
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingApi: Send + Sync {
    /// Produce one normalized vector for the supplied text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// HTTP embedding adapter with credential failover.
pub struct HttpEmbeddingClient {
    client: Client,
    url: String,
    keys: Arc<Vec<String>>,
    /// Index of the first credential that has not been marked dead.
    active_key: AtomicUsize,
    model: String,
    dimension: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbeddingClient {
    /// Build the client from the loaded configuration.
    pub fn from_config() -> Result<Self, EmbeddingError> {
        let config = get_config();
        Self::new(
            &config.embedding_api_url,
            config.embedding_api_keys.clone(),
            &config.embedding_model,
            config.embedding_dimension,
            Duration::from_secs(config.embedding_timeout_secs),
        )
    }

    /// Build the client with explicit settings.
    pub fn new(
        url: &str,
        keys: Vec<String>,
        model: &str,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .user_agent(concat!("docsmcp/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|err| EmbeddingError::TransientUpstream(err.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
            keys: Arc::new(keys),
            active_key: AtomicUsize::new(0),
            model: model.to_string(),
            dimension,
        })
    }

    async fn request_once(&self, text: &str, key: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(key)
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await
            .map_err(|err| EmbeddingError::TransientUpstream(err.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(EmbeddingError::TransientUpstream(format!(
                "upstream returned {status}"
            )));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(EmbeddingError::InvalidCredential);
        }
        if !status.is_success() {
            return Err(EmbeddingError::MalformedUpstreamResponse(format!(
                "unexpected status {status}"
            )));
        }

        let payload: EmbeddingResponse = response
            .json()
            .await
            .map_err(|err| EmbeddingError::MalformedUpstreamResponse(err.to_string()))?;
        let vector = payload
            .data
            .into_iter()
            .next()
            .map(|datum| datum.embedding)
            .ok_or_else(|| {
                EmbeddingError::MalformedUpstreamResponse("response carried no embedding".into())
            })?;
        if vector.len() != self.dimension {
            return Err(EmbeddingError::MalformedUpstreamResponse(format!(
                "expected {} dimensions, got {}",
                self.dimension,
                vector.len()
            )));
        }
        Ok(vector)
    }

    /// Mark `index` dead and move to the next credential, if any.
    fn fail_over(&self, index: usize) -> Option<usize> {
        let _ = self
            .active_key
            .compare_exchange(index, index + 1, Ordering::SeqCst, Ordering::SeqCst);
        let next = self.active_key.load(Ordering::SeqCst);
        (next < self.keys.len()).then_some(next)
    }
}

#[async_trait]
impl EmbeddingApi for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let mut retries = 0;
        let mut key_index = self
            .active_key
            .load(Ordering::SeqCst)
            .min(self.keys.len().saturating_sub(1));

        loop {
            let key = &self.keys[key_index];
            match self.request_once(text, key).await {
                Ok(vector) => return Ok(normalize(vector)),
                Err(EmbeddingError::InvalidCredential) => {
                    tracing::warn!(key_index, "Embedding credential rejected; failing over");
                    match self.fail_over(key_index) {
                        Some(next) => key_index = next,
                        None => return Err(EmbeddingError::InvalidCredential),
                    }
                }
                Err(EmbeddingError::TransientUpstream(reason)) if retries < MAX_RETRIES => {
                    let delay = BACKOFF_CAP.min(BACKOFF_BASE * 2u32.pow(retries));
                    tracing::warn!(
                        retries,
                        delay_ms = delay.as_millis() as u64,
                        reason,
                        "Transient embedding failure; backing off"
                    );
                    retries += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Divide each component by the Euclidean norm.
///
/// Zero-norm vectors are returned unchanged with a warning so callers never divide by zero.
pub fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    } else {
        tracing::warn!("Embedding vector has zero norm; returning unnormalized");
    }
    vector
}
