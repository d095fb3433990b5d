//! Credential resolution, rate counters, and usage logs.
//!
//! This adapter owns everything keyed by "who is calling": bearer-token and authorized-IP
//! lookups (each a single join against the user table), the atomic rate-counter upsert, and
//! the best-effort search/fetch logs. Successful lookups schedule a non-blocking
//! `last_used_at` touch through the write-behind queue; log writes go the same way and never
//! surface failures to the caller.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use time::{Duration, OffsetDateTime};

use crate::auth::PlanTier;
use crate::store::StoreError;
use crate::store::writeback::{WriteJob, WritebackQueue};

/// A user resolved from a token or an authorized IP.
#[derive(Debug, Clone)]
pub struct UserRecord {
    /// Primary user id.
    pub user_id: i64,
    /// Account email.
    pub email: String,
    /// Optional display name.
    pub name: Option<String>,
    /// Subscription tier used for rate limiting.
    pub plan: PlanTier,
}

/// Outcome of a bearer-token validation.
#[derive(Debug, Clone)]
pub enum TokenLookup {
    /// The token resolved to a user.
    Valid(UserRecord),
    /// The token shape is wrong; no lookup was attempted.
    FormatInvalid,
    /// The token shape is fine but no record matches.
    NotFound,
}

/// Rate-limit window kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWindow {
    /// Minute-granularity burst window.
    Short,
    /// Seven-day quota window.
    Long,
}

impl RateWindow {
    /// Window length in seconds.
    pub fn length_secs(self) -> i64 {
        match self {
            Self::Short => 60,
            Self::Long => 7 * 24 * 60 * 60,
        }
    }

    /// Stable key stored in the counter table.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Long => "long",
        }
    }

    /// Start of the bucket containing `now`.
    pub fn bucket_start(self, now: OffsetDateTime) -> OffsetDateTime {
        let len = self.length_secs();
        let ts = now.unix_timestamp();
        let start = ts - ts.rem_euclid(len);
        OffsetDateTime::from_unix_timestamp(start).unwrap_or(now)
    }
}

/// Result of an atomic increment-and-check.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    /// Whether the request fits under the limit.
    pub allowed: bool,
    /// The limit that was applied.
    pub limit: u32,
    /// Requests left in the window (zero when denied).
    pub remaining: u32,
    /// When the window rolls over.
    pub resets_at: OffsetDateTime,
}

/// One row of the search log.
#[derive(Debug, Clone)]
pub struct SearchLogEntry {
    /// Identity key (`user:<id>` or `ip:<addr>`).
    pub identity_key: String,
    /// Bearer token presented, if any.
    pub token: Option<String>,
    /// The query as received (trimmed).
    pub query: String,
    /// Number of ranked results returned.
    pub result_count: usize,
    /// End-to-end handler latency.
    pub latency_ms: u64,
    /// HTTP-equivalent status code.
    pub status: u16,
    /// Stable error code when the call failed.
    pub error_code: Option<String>,
    /// Client IP observed on the transport.
    pub client_ip: String,
}

/// One row of the fetch log.
#[derive(Debug, Clone)]
pub struct FetchLogEntry {
    /// Identity key (`user:<id>` or `ip:<addr>`).
    pub identity_key: String,
    /// Bearer token presented, if any.
    pub token: Option<String>,
    /// URL exactly as the client sent it.
    pub requested_url: String,
    /// URL after normalization.
    pub actual_url: String,
    /// Page id when the fetch succeeded.
    pub page_id: Option<String>,
    /// End-to-end handler latency.
    pub latency_ms: u64,
    /// HTTP-equivalent status code.
    pub status: u16,
    /// Stable error code when the call failed.
    pub error_code: Option<String>,
    /// Client IP observed on the transport.
    pub client_ip: String,
}

/// Identity operations used by auth, rate limiting, and the tool executors.
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// Resolve a bearer token to a user, pre-checking its shape.
    async fn validate_token(&self, token: &str) -> Result<TokenLookup, StoreError>;

    /// Resolve an authorized client IP to a user.
    async fn resolve_ip(&self, ip: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Atomically bump the counter for `(identity_key, window)` and compare against `limit`.
    async fn increment_and_check(
        &self,
        identity_key: &str,
        window: RateWindow,
        limit: u32,
    ) -> Result<RateDecision, StoreError>;

    /// Record a search; best-effort and non-blocking.
    fn log_search(&self, entry: SearchLogEntry);

    /// Record a fetch; best-effort and non-blocking.
    fn log_fetch(&self, entry: FetchLogEntry);
}

/// Expected shape of a bearer token: `at_` followed by 32 lowercase hex characters.
pub fn token_format_valid(token: &str) -> bool {
    let Some(rest) = token.strip_prefix("at_") else {
        return false;
    };
    rest.len() == 32
        && rest
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Postgres-backed identity adapter.
pub struct IdentityStore {
    pool: PgPool,
    writeback: WritebackQueue,
}

impl IdentityStore {
    /// Wrap the shared pool and the write-behind queue.
    pub fn new(pool: PgPool, writeback: WritebackQueue) -> Self {
        Self { pool, writeback }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    user_id: i64,
    email: String,
    name: Option<String>,
    plan: String,
}

impl From<UserRow> for UserRecord {
    fn from(row: UserRow) -> Self {
        Self {
            user_id: row.user_id,
            email: row.email,
            name: row.name,
            plan: row.plan.parse().unwrap_or(PlanTier::Free),
        }
    }
}

#[async_trait]
impl IdentityApi for IdentityStore {
    async fn validate_token(&self, token: &str) -> Result<TokenLookup, StoreError> {
        if !token_format_valid(token) {
            return Ok(TokenLookup::FormatInvalid);
        }

        let row = sqlx::query_as::<_, UserRow>(
            r"SELECT u.id AS user_id, u.email, u.name, u.plan
              FROM access_tokens t
              JOIN users u ON u.id = t.user_id
              WHERE t.token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                self.writeback.enqueue(WriteJob::TouchToken {
                    token: token.to_string(),
                });
                Ok(TokenLookup::Valid(row.into()))
            }
            None => Ok(TokenLookup::NotFound),
        }
    }

    async fn resolve_ip(&self, ip: &str) -> Result<Option<UserRecord>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            r"SELECT u.id AS user_id, u.email, u.name, u.plan
              FROM authorized_ips a
              JOIN users u ON u.id = a.user_id
              WHERE a.ip = $1",
        )
        .bind(ip)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_some() {
            self.writeback
                .enqueue(WriteJob::TouchIp { ip: ip.to_string() });
        }
        Ok(row.map(UserRecord::from))
    }

    async fn increment_and_check(
        &self,
        identity_key: &str,
        window: RateWindow,
        limit: u32,
    ) -> Result<RateDecision, StoreError> {
        let window_start = window.bucket_start(OffsetDateTime::now_utc());
        // The upsert and the comparison against the returned count form a single atomic step
        // with respect to concurrent callers.
        let count: i64 = sqlx::query_scalar(
            r"INSERT INTO rate_counters (identity_key, window_kind, window_start, count)
              VALUES ($1, $2, $3, 1)
              ON CONFLICT (identity_key, window_kind, window_start)
              DO UPDATE SET count = rate_counters.count + 1
              RETURNING count",
        )
        .bind(identity_key)
        .bind(window.as_str())
        .bind(window_start)
        .fetch_one(&self.pool)
        .await?;

        let allowed = count <= i64::from(limit);
        let remaining = u32::try_from(i64::from(limit) - count).unwrap_or(0);
        Ok(RateDecision {
            allowed,
            limit,
            remaining,
            resets_at: window_start + Duration::seconds(window.length_secs()),
        })
    }

    fn log_search(&self, entry: SearchLogEntry) {
        self.writeback.enqueue(WriteJob::LogSearch(entry));
    }

    fn log_fetch(&self, entry: FetchLogEntry) {
        self.writeback.enqueue(WriteJob::LogFetch(entry));
    }
}
