//! In-progress request tracking, cancellation, and progress reporting.
//!
//! Every non-`initialize` request is registered here for the duration of its handling.
//! Cancellation (client-sent or deadline-driven) flips the request's token; the dispatch
//! loop observes it at the next await point. Completed entries linger for a short grace
//! window so late `notifications/cancelled` messages can still be matched instead of
//! re-registering the id.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::mcp::protocol::progress_notification;

/// Entries older than this are dropped regardless of state.
const MAX_REQUEST_AGE: Duration = Duration::from_secs(5 * 60);
/// Completed entries linger this long to absorb cancellation races.
const COMPLETION_GRACE: Duration = Duration::from_secs(5);
/// Minimum spacing between emitted progress updates.
const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);
/// Progress claims older than this are dropped by cleanup.
const MAX_PROGRESS_AGE: Duration = Duration::from_secs(5 * 60);

/// Canonical map key for a JSON-RPC request id.
pub fn request_key(id: &Value) -> String {
    id.to_string()
}

/// One tracked in-progress request.
#[derive(Debug)]
struct InflightRequest {
    method: String,
    started_at: Instant,
    token: CancellationToken,
    session_id: Option<String>,
    identity_key: String,
    completed_at: Option<Instant>,
}

/// Why a cancellation was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The request was aborted.
    Cancelled,
    /// No live entry matched the id.
    UnknownRequest,
    /// The entry already completed.
    AlreadyCompleted,
    /// Session or identity did not match; foreign cancellations are ignored.
    ForeignRequest,
}

/// Process-wide table of in-progress requests.
#[derive(Default)]
pub struct InflightRegistry {
    requests: DashMap<String, InflightRequest>,
}

impl InflightRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request and hand back its cancellation token.
    pub fn register(
        &self,
        id: &Value,
        method: &str,
        session_id: Option<&str>,
        identity_key: &str,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        self.requests.insert(
            request_key(id),
            InflightRequest {
                method: method.to_string(),
                started_at: Instant::now(),
                token: token.clone(),
                session_id: session_id.map(str::to_string),
                identity_key: identity_key.to_string(),
                completed_at: None,
            },
        );
        token
    }

    /// Mark a request finished; the entry stays for the grace window.
    pub fn complete(&self, id: &Value) {
        if let Some(mut entry) = self.requests.get_mut(&request_key(id)) {
            entry.completed_at = Some(Instant::now());
        }
    }

    /// Cancel a request on behalf of `(session_id, identity_key)`.
    ///
    /// Cancellations from another session or identity are reported and otherwise ignored.
    pub fn cancel(
        &self,
        id: &Value,
        session_id: Option<&str>,
        identity_key: &str,
    ) -> CancelOutcome {
        let key = request_key(id);
        let Some(entry) = self.requests.get(&key) else {
            return CancelOutcome::UnknownRequest;
        };
        if entry.completed_at.is_some() {
            return CancelOutcome::AlreadyCompleted;
        }
        if entry.session_id.as_deref() != session_id || entry.identity_key != identity_key {
            tracing::warn!(request = %key, method = %entry.method, "Ignoring foreign cancellation");
            return CancelOutcome::ForeignRequest;
        }
        entry.token.cancel();
        CancelOutcome::Cancelled
    }

    /// Drop aged entries and completed entries past their grace window.
    pub fn expire(&self) -> usize {
        let now = Instant::now();
        let before = self.requests.len();
        self.requests.retain(|_, entry| {
            if now.duration_since(entry.started_at) >= MAX_REQUEST_AGE {
                entry.token.cancel();
                return false;
            }
            match entry.completed_at {
                Some(completed) => now.duration_since(completed) < COMPLETION_GRACE,
                None => true,
            }
        });
        before - self.requests.len()
    }

    /// Number of live entries (for tests and diagnostics).
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[derive(Debug)]
struct ProgressClaim {
    request_key: String,
    last_value: f64,
    last_emit: Option<Instant>,
    created_at: Instant,
}

/// Table of progress tokens claimed by in-progress requests.
#[derive(Default)]
pub struct ProgressTable {
    claims: DashMap<String, ProgressClaim>,
}

impl ProgressTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `token` for `request_id`; a token belongs to exactly one request.
    pub fn claim(&self, token: &Value, request_id: &Value) -> bool {
        let key = request_key(token);
        let req = request_key(request_id);
        let mut claimed = false;
        self.claims.entry(key).or_insert_with(|| {
            claimed = true;
            ProgressClaim {
                request_key: req.clone(),
                last_value: 0.0,
                last_emit: None,
                created_at: Instant::now(),
            }
        });
        if !claimed {
            // Re-claiming from the same request is fine; another request is not.
            claimed = self
                .claims
                .get(&request_key(token))
                .map(|claim| claim.request_key == req)
                .unwrap_or(false);
        }
        claimed
    }

    /// Record an update; returns `true` when it should be emitted.
    ///
    /// Values are monotonically non-decreasing and updates are spaced by a minimum
    /// interval; out-of-order or too-frequent updates are swallowed.
    fn advance(&self, token: &Value, value: f64) -> bool {
        let Some(mut claim) = self.claims.get_mut(&request_key(token)) else {
            return false;
        };
        if value < claim.last_value {
            return false;
        }
        let now = Instant::now();
        if let Some(last) = claim.last_emit {
            if now.duration_since(last) < MIN_PROGRESS_INTERVAL {
                claim.last_value = value;
                return false;
            }
        }
        claim.last_value = value;
        claim.last_emit = Some(now);
        true
    }

    /// Release the claim held by a finished request.
    pub fn release(&self, token: &Value) {
        self.claims.remove(&request_key(token));
    }

    /// Drop stale claims; returns how many were removed.
    pub fn expire(&self) -> usize {
        let now = Instant::now();
        let before = self.claims.len();
        self.claims
            .retain(|_, claim| now.duration_since(claim.created_at) < MAX_PROGRESS_AGE);
        before - self.claims.len()
    }
}

/// Per-request handle used by executors to emit progress notifications.
pub struct ProgressSender {
    token: Value,
    tx: mpsc::Sender<Value>,
}

impl ProgressSender {
    /// Wrap a claimed token and the stream channel.
    pub fn new(token: Value, tx: mpsc::Sender<Value>) -> Self {
        Self { token, tx }
    }

    /// The claimed token (used to release it after completion).
    pub fn token(&self) -> &Value {
        &self.token
    }

    /// Emit an update when the table's monotonicity and spacing rules allow it.
    pub fn update(&self, table: &ProgressTable, progress: f64, message: Option<&str>) {
        if !table.advance(&self.token, progress) {
            return;
        }
        let note = progress_notification(&self.token, progress, message);
        if self.tx.try_send(note).is_err() {
            tracing::debug!("Progress channel full or closed; dropping update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> Value {
        Value::from(n)
    }

    #[test]
    fn cancel_matches_session_and_identity() {
        let registry = InflightRegistry::new();
        let token = registry.register(&id(1), "tools/call", Some("s1"), "user:1");

        assert_eq!(
            registry.cancel(&id(1), Some("s2"), "user:1"),
            CancelOutcome::ForeignRequest
        );
        assert_eq!(
            registry.cancel(&id(1), Some("s1"), "user:2"),
            CancelOutcome::ForeignRequest
        );
        assert!(!token.is_cancelled());

        assert_eq!(
            registry.cancel(&id(1), Some("s1"), "user:1"),
            CancelOutcome::Cancelled
        );
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_after_completion_is_ignored() {
        let registry = InflightRegistry::new();
        let token = registry.register(&id(1), "tools/call", None, "ip:1.1.1.1");
        registry.complete(&id(1));
        assert_eq!(
            registry.cancel(&id(1), None, "ip:1.1.1.1"),
            CancelOutcome::AlreadyCompleted
        );
        assert!(!token.is_cancelled());
    }

    #[test]
    fn unknown_request_cancellation_is_ignored() {
        let registry = InflightRegistry::new();
        assert_eq!(
            registry.cancel(&id(9), None, "ip:1.1.1.1"),
            CancelOutcome::UnknownRequest
        );
    }

    #[test]
    fn string_and_number_ids_do_not_collide() {
        let registry = InflightRegistry::new();
        registry.register(&Value::from(1), "tools/call", None, "a");
        registry.register(&Value::from("1"), "tools/call", None, "b");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn progress_tokens_belong_to_one_request() {
        let table = ProgressTable::new();
        assert!(table.claim(&Value::from("tok"), &id(1)));
        assert!(table.claim(&Value::from("tok"), &id(1)));
        assert!(!table.claim(&Value::from("tok"), &id(2)));
    }

    #[test]
    fn progress_values_are_monotonic() {
        let table = ProgressTable::new();
        let token = Value::from("tok");
        assert!(table.claim(&token, &id(1)));
        assert!(table.advance(&token, 0.2));
        // Backwards movement is swallowed.
        assert!(!table.advance(&token, 0.1));
    }

    #[test]
    fn progress_updates_are_rate_limited() {
        let table = ProgressTable::new();
        let token = Value::from("tok");
        assert!(table.claim(&token, &id(1)));
        assert!(table.advance(&token, 0.1));
        // Immediately after an emit the next update is suppressed.
        assert!(!table.advance(&token, 0.2));
    }

    #[tokio::test]
    async fn sender_emits_through_the_channel() {
        let table = ProgressTable::new();
        let token = Value::from("tok");
        assert!(table.claim(&token, &id(1)));
        let (tx, mut rx) = mpsc::channel(4);
        let sender = ProgressSender::new(token, tx);
        sender.update(&table, 0.5, Some("reranking"));
        let note = rx.recv().await.expect("notification");
        assert_eq!(note["params"]["progress"], 0.5);
    }
}
