//! Reranker client abstraction and HTTP adapter.
//!
//! The reranker is a cross-encoder that sees the query and each candidate together and
//! returns relevance scores for the top entries. Transient faults are retried immediately
//! (the call is close to idempotent); credential handling mirrors the embedding client.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::get_config;

/// Additional attempts after a transient failure.
const MAX_RETRIES: u32 = 2;

/// Errors raised by the reranker.
#[derive(Debug, Error)]
pub enum RerankError {
    /// Upstream fault worth retrying (5xx, timeout, network).
    #[error("transient rerank failure: {0}")]
    TransientUpstream(String),
    /// Every configured credential was rejected.
    #[error("rerank credentials rejected")]
    InvalidCredential,
    /// The provider answered with something we cannot use.
    #[error("malformed rerank response: {0}")]
    MalformedUpstreamResponse(String),
    /// Caller passed no documents or a non-positive `top_n`.
    #[error("rerank input invalid: {0}")]
    InvalidInput(&'static str),
}

/// One scored entry returned by the reranker.
#[derive(Debug, Clone)]
pub struct RerankHit {
    /// Index into the submitted document list.
    pub original_index: usize,
    /// Relevance score; higher is better.
    pub relevance_score: f32,
}

/// Interface implemented by rerank backends.
#[async_trait]
pub trait RerankApi: Send + Sync {
    /// Score `documents` against `query` and return at most `top_n` entries,
    /// sorted by descending relevance.
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankHit>, RerankError>;
}

/// HTTP rerank adapter with credential failover.
pub struct HttpRerankClient {
    client: Client,
    url: String,
    keys: Arc<Vec<String>>,
    active_key: AtomicUsize,
    model: String,
    instruction: String,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

impl HttpRerankClient {
    /// Build the client from the loaded configuration.
    pub fn from_config() -> Result<Self, RerankError> {
        let config = get_config();
        Self::new(
            &config.rerank_api_url,
            config.rerank_api_keys.clone(),
            &config.rerank_model,
            &config.rerank_instruction,
            Duration::from_secs(30),
        )
    }

    /// Build the client with explicit settings.
    pub fn new(
        url: &str,
        keys: Vec<String>,
        model: &str,
        instruction: &str,
        timeout: Duration,
    ) -> Result<Self, RerankError> {
        let client = Client::builder()
            .user_agent(concat!("docsmcp/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|err| RerankError::TransientUpstream(err.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
            keys: Arc::new(keys),
            active_key: AtomicUsize::new(0),
            model: model.to_string(),
            instruction: instruction.to_string(),
        })
    }

    async fn request_once(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
        key: &str,
    ) -> Result<Vec<RerankHit>, RerankError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(key)
            .json(&json!({
                "model": self.model,
                "query": query,
                "documents": documents,
                "top_n": top_n,
                "instruction": self.instruction,
            }))
            .send()
            .await
            .map_err(|err| RerankError::TransientUpstream(err.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(RerankError::TransientUpstream(format!(
                "upstream returned {status}"
            )));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RerankError::InvalidCredential);
        }
        if !status.is_success() {
            return Err(RerankError::MalformedUpstreamResponse(format!(
                "unexpected status {status}"
            )));
        }

        let payload: RerankResponse = response
            .json()
            .await
            .map_err(|err| RerankError::MalformedUpstreamResponse(err.to_string()))?;

        let mut hits = Vec::with_capacity(payload.results.len());
        for result in payload.results {
            if result.index >= documents.len() {
                return Err(RerankError::MalformedUpstreamResponse(format!(
                    "result index {} out of range",
                    result.index
                )));
            }
            hits.push(RerankHit {
                original_index: result.index,
                relevance_score: result.relevance_score,
            });
        }
        Ok(hits)
    }

    fn fail_over(&self, index: usize) -> Option<usize> {
        let _ = self
            .active_key
            .compare_exchange(index, index + 1, Ordering::SeqCst, Ordering::SeqCst);
        let next = self.active_key.load(Ordering::SeqCst);
        (next < self.keys.len()).then_some(next)
    }
}

#[async_trait]
impl RerankApi for HttpRerankClient {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankHit>, RerankError> {
        if documents.is_empty() {
            return Err(RerankError::InvalidInput("documents must not be empty"));
        }
        if top_n == 0 {
            return Err(RerankError::InvalidInput("top_n must be positive"));
        }
        let top_n = top_n.min(documents.len());

        let mut retries = 0;
        let mut key_index = self
            .active_key
            .load(Ordering::SeqCst)
            .min(self.keys.len().saturating_sub(1));

        loop {
            let key = &self.keys[key_index];
            match self.request_once(query, documents, top_n, key).await {
                Ok(mut hits) => {
                    hits.truncate(top_n);
                    return Ok(hits);
                }
                Err(RerankError::InvalidCredential) => {
                    tracing::warn!(key_index, "Rerank credential rejected; failing over");
                    match self.fail_over(key_index) {
                        Some(next) => key_index = next,
                        None => return Err(RerankError::InvalidCredential),
                    }
                }
                Err(RerankError::TransientUpstream(reason)) if retries < MAX_RETRIES => {
                    tracing::warn!(retries, reason, "Transient rerank failure; retrying");
                    retries += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    fn docs(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| (*t).to_string()).collect()
    }

    fn client_for(server: &MockServer, keys: Vec<String>) -> HttpRerankClient {
        HttpRerankClient::new(
            &server.url("/rerank"),
            keys,
            "test-rerank",
            "rank these",
            Duration::from_secs(5),
        )
        .expect("client")
    }

    #[tokio::test]
    async fn rerank_rejects_empty_documents() {
        let server = MockServer::start_async().await;
        let client = client_for(&server, vec!["k1".into()]);
        let err = client.rerank("q", &[], 3).await.unwrap_err();
        assert!(matches!(err, RerankError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn rerank_clamps_top_n_and_maps_scores() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/rerank")
                    .json_body_partial(r#"{ "top_n": 2 }"#);
                then.status(200).json_body(serde_json::json!({
                    "results": [
                        { "index": 1, "relevance_score": 0.9, "document": "b" },
                        { "index": 0, "relevance_score": 0.3, "document": "a" }
                    ]
                }));
            })
            .await;

        let client = client_for(&server, vec!["k1".into()]);
        let hits = client
            .rerank("q", &docs(&["a", "b"]), 5)
            .await
            .expect("hits");
        mock.assert();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].original_index, 1);
        assert!((hits[0].relevance_score - 0.9).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn rerank_retries_transient_failures_without_delay() {
        let server = MockServer::start_async().await;
        let failing = server
            .mock_async(|when, then| {
                when.method(POST).path("/rerank");
                then.status(503);
            })
            .await;

        let client = client_for(&server, vec!["k1".into()]);
        let err = client.rerank("q", &docs(&["a"]), 1).await.unwrap_err();
        assert!(matches!(err, RerankError::TransientUpstream(_)));
        // Initial attempt plus two retries.
        failing.assert_hits(3);
    }

    #[tokio::test]
    async fn rerank_rejects_out_of_range_indices() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/rerank");
                then.status(200).json_body(serde_json::json!({
                    "results": [ { "index": 9, "relevance_score": 0.5 } ]
                }));
            })
            .await;

        let client = client_for(&server, vec!["k1".into()]);
        let err = client.rerank("q", &docs(&["a"]), 1).await.unwrap_err();
        assert!(matches!(err, RerankError::MalformedUpstreamResponse(_)));
    }
}
