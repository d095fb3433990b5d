//! Per-identity rate limiting over two rolling windows.
//!
//! Every tool call burns one unit in a minute-scale burst window and, when that passes, one
//! unit in a week-scale quota window. Limits come from the identity's plan tier; anonymous
//! callers get the lowest tier. Denials are surfaced as plain tool output by the executors,
//! never as transport-level errors, and protocol methods are never limited.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::auth::Identity;
use crate::store::StoreError;
use crate::store::identity::{IdentityApi, RateWindow};

/// Which window denied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitWindow {
    /// Minute-scale burst window.
    Short,
    /// Week-scale quota window.
    Long,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy)]
pub enum RateCheck {
    /// The request may proceed.
    Allowed,
    /// The request exceeded a window.
    Denied {
        /// Which window was exhausted.
        window: LimitWindow,
        /// The limit applied to that window.
        limit: u32,
        /// When the window rolls over.
        resets_at: OffsetDateTime,
    },
}

impl RateCheck {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Two-window limiter backed by the identity store's atomic counters.
pub struct RateLimiter {
    store: Arc<dyn IdentityApi>,
}

impl RateLimiter {
    /// Build a limiter over the identity store.
    pub fn new(store: Arc<dyn IdentityApi>) -> Self {
        Self { store }
    }

    /// Burn one unit for `identity` and report whether it fit.
    ///
    /// The short window is checked first and is counted even when the long window later
    /// denies; the two windows are deliberately not linked transactionally.
    pub async fn check(&self, identity: &Identity) -> Result<RateCheck, StoreError> {
        let (short_limit, long_limit) = identity.plan().limits();
        let key = identity.key();

        let short = self
            .store
            .increment_and_check(&key, RateWindow::Short, short_limit)
            .await?;
        if !short.allowed {
            tracing::info!(identity = %key, limit = short_limit, "Short-window rate limit hit");
            return Ok(RateCheck::Denied {
                window: LimitWindow::Short,
                limit: short_limit,
                resets_at: short.resets_at,
            });
        }

        let long = self
            .store
            .increment_and_check(&key, RateWindow::Long, long_limit)
            .await?;
        if !long.allowed {
            tracing::info!(identity = %key, limit = long_limit, "Long-window rate limit hit");
            return Ok(RateCheck::Denied {
                window: LimitWindow::Long,
                limit: long_limit,
                resets_at: long.resets_at,
            });
        }

        Ok(RateCheck::Allowed)
    }
}
