//! Tool executors for the MCP server.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::auth::Identity;
use crate::mcp::inflight::{ProgressSender, ProgressTable};
use crate::mcp::protocol::RpcError;
use crate::ratelimit::RateLimiter;
use crate::retrieval::RetrievalApi;
use crate::store::corpus::CorpusApi;
use crate::store::identity::IdentityApi;

pub mod fetch;
pub mod search;

/// Long-lived collaborators shared by every tool invocation.
pub struct ToolDeps {
    /// Hybrid retrieval engine behind `search`.
    pub retrieval: Arc<dyn RetrievalApi>,
    /// Corpus reader behind `fetch`.
    pub corpus: Arc<dyn CorpusApi>,
    /// Identity store used for usage logs.
    pub identity_store: Arc<dyn IdentityApi>,
    /// Two-window limiter consulted before any tool work.
    pub limiter: RateLimiter,
}

/// Per-invocation request context handed to the executors.
pub struct ToolContext<'a> {
    /// Resolved caller identity.
    pub identity: &'a Identity,
    /// Client IP recorded in logs.
    pub client_ip: &'a str,
    /// Progress handle when the client supplied a progress token.
    pub progress: Option<&'a ProgressSender>,
    /// Table enforcing progress monotonicity and spacing.
    pub progress_table: &'a ProgressTable,
}

impl ToolContext<'_> {
    /// Emit a progress update when the client asked for one.
    pub(crate) fn progress(&self, value: f64, message: &str) {
        if let Some(sender) = self.progress {
            sender.update(self.progress_table, value, Some(message));
        }
    }
}

/// Deserialize tool arguments into the target type.
pub(crate) fn parse_arguments<T: DeserializeOwned>(arguments: Option<Value>) -> Result<T, RpcError> {
    let value = arguments.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    serde_json::from_value(value)
        .map_err(|err| RpcError::invalid_params(format!("Invalid arguments: {err}")))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared stubs for executor tests.

    use super::ToolDeps;
    use crate::ratelimit::RateLimiter;
    use crate::retrieval::merge::ProcessedResult;
    use crate::retrieval::{RankedResult, RetrievalApi, RetrievalError, SearchOutcome};
    use crate::store::StoreError;
    use crate::store::corpus::{CorpusApi, KeywordHit, Page, VectorHit};
    use crate::store::identity::{
        FetchLogEntry, IdentityApi, RateDecision, RateWindow, SearchLogEntry, TokenLookup,
        UserRecord,
    };
    use async_trait::async_trait;
    use std::sync::Arc;
    use time::OffsetDateTime;

    /// Retrieval stub returning a fixed number of ranked results.
    #[derive(Default)]
    pub(crate) struct StubRetrieval {
        results: usize,
    }

    impl StubRetrieval {
        pub(crate) fn with_results(results: usize) -> Self {
            Self { results }
        }
    }

    #[async_trait]
    impl RetrievalApi for StubRetrieval {
        async fn search(
            &self,
            _query: &str,
            requested: usize,
        ) -> Result<SearchOutcome, RetrievalError> {
            let ranked = (0..self.results.min(requested))
                .map(|i| RankedResult {
                    result: ProcessedResult {
                        id: format!("c{i}"),
                        url: format!("https://docs.example/{i}"),
                        context: format!("Doc {i}"),
                        content: format!("Body {i}"),
                        merged_from: vec![format!("c{i}")],
                    },
                    score: 1.0 - i as f32 * 0.1,
                })
                .collect();
            Ok(SearchOutcome {
                ranked,
                additional_urls: vec![],
            })
        }
    }

    /// Identity stub with togglable rate-limit behavior.
    #[derive(Default)]
    pub(crate) struct StubIdentity {
        deny_short: bool,
    }

    impl StubIdentity {
        pub(crate) fn denying() -> Self {
            Self { deny_short: true }
        }
    }

    #[async_trait]
    impl IdentityApi for StubIdentity {
        async fn validate_token(&self, _token: &str) -> Result<TokenLookup, StoreError> {
            Ok(TokenLookup::NotFound)
        }

        async fn resolve_ip(&self, _ip: &str) -> Result<Option<UserRecord>, StoreError> {
            Ok(None)
        }

        async fn increment_and_check(
            &self,
            _identity_key: &str,
            window: RateWindow,
            limit: u32,
        ) -> Result<RateDecision, StoreError> {
            let denied = self.deny_short && window == RateWindow::Short;
            Ok(RateDecision {
                allowed: !denied,
                limit,
                remaining: if denied { 0 } else { limit },
                resets_at: OffsetDateTime::now_utc(),
            })
        }

        fn log_search(&self, _entry: SearchLogEntry) {}
        fn log_fetch(&self, _entry: FetchLogEntry) {}
    }

    /// Corpus stub serving a single optional page.
    pub(crate) struct StubCorpus {
        page: Option<Page>,
    }

    #[async_trait]
    impl CorpusApi for StubCorpus {
        async fn vector_search(
            &self,
            _query_vector: &[f32],
            _k: usize,
        ) -> Result<Vec<VectorHit>, StoreError> {
            Ok(vec![])
        }

        async fn keyword_search(
            &self,
            _query_text: &str,
            _k: usize,
        ) -> Result<Vec<KeywordHit>, StoreError> {
            Ok(vec![])
        }

        async fn page_by_url(&self, url: &str) -> Result<Option<Page>, StoreError> {
            Ok(self
                .page
                .as_ref()
                .filter(|page| page.url == url)
                .cloned())
        }
    }

    pub(crate) fn deps_with(retrieval: StubRetrieval, identity: StubIdentity) -> ToolDeps {
        let identity: Arc<dyn IdentityApi> = Arc::new(identity);
        ToolDeps {
            retrieval: Arc::new(retrieval),
            corpus: Arc::new(StubCorpus { page: None }),
            identity_store: identity.clone(),
            limiter: RateLimiter::new(identity),
        }
    }

    pub(crate) fn deps_with_page(
        retrieval: StubRetrieval,
        identity: StubIdentity,
        page: Page,
    ) -> ToolDeps {
        let identity: Arc<dyn IdentityApi> = Arc::new(identity);
        ToolDeps {
            retrieval: Arc::new(retrieval),
            corpus: Arc::new(StubCorpus { page: Some(page) }),
            identity_store: identity.clone(),
            limiter: RateLimiter::new(identity),
        }
    }
}
