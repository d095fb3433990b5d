//! Request identity resolution.
//!
//! Every request is mapped to exactly one [`Identity`]: a bearer token wins when it validates,
//! an authorized client IP comes next, and everything else is anonymous keyed by IP. Failed
//! token validation is logged but never fatal; the request degrades to IP-based and then
//! anonymous resolution, so presenting a bad token is never worse than presenting none.
//! Successful resolutions are memoized in a shared TTL cache to keep the store off the hot
//! path.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use moka::future::Cache;

use crate::config::get_config;
use crate::store::identity::{IdentityApi, TokenLookup, UserRecord};

/// Synthetic token recorded for IP-resolved identities so logs stay uniform.
pub const IP_BASED_TOKEN: &str = "ip-based";

/// Cache TTL for token and IP resolutions.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Subscription tiers recognized by the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanTier {
    /// Default tier; also applied to anonymous callers.
    Free,
    /// Paid tier with raised limits.
    Pro,
}

impl FromStr for PlanTier {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pro" | "premium" => Ok(Self::Pro),
            _ => Ok(Self::Free),
        }
    }
}

impl PlanTier {
    /// Short- and long-window limits for this tier.
    pub fn limits(self) -> (u32, u32) {
        let config = get_config();
        match self {
            Self::Free => (config.rate_limit_free_short, config.rate_limit_free_long),
            Self::Pro => (config.rate_limit_pro_short, config.rate_limit_pro_long),
        }
    }
}

/// An authenticated principal, with the credential that produced it.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    /// Primary user id.
    pub user_id: i64,
    /// Account email.
    pub email: String,
    /// Subscription tier.
    pub plan: PlanTier,
    /// Token string for downstream logging (`ip-based` for IP resolutions).
    pub token: String,
}

/// Who is making the request.
#[derive(Debug, Clone)]
pub enum Identity {
    /// A known user, resolved from a token or an authorized IP.
    Authenticated(UserIdentity),
    /// Unknown caller, keyed by client IP.
    Anonymous {
        /// Client IP acting as the pseudo-identity.
        ip: String,
    },
}

impl Identity {
    /// Stable key used for rate counters and logs.
    pub fn key(&self) -> String {
        match self {
            Self::Authenticated(user) => format!("user:{}", user.user_id),
            Self::Anonymous { ip } => format!("ip:{ip}"),
        }
    }

    /// Plan tier applied to this identity; anonymous callers get the lowest tier.
    pub fn plan(&self) -> PlanTier {
        match self {
            Self::Authenticated(user) => user.plan,
            Self::Anonymous { .. } => PlanTier::Free,
        }
    }

    /// Token to record in logs, when one exists.
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Authenticated(user) => Some(&user.token),
            Self::Anonymous { .. } => None,
        }
    }

    /// Whether the caller is anonymous.
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous { .. })
    }
}

/// Extract the bearer token from an `Authorization` header value.
///
/// The scheme match is case-insensitive; surrounding whitespace is trimmed.
pub fn bearer_token(header: &str) -> Option<&str> {
    let trimmed = header.trim();
    let (scheme, rest) = trimmed.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = rest.trim();
    (!token.is_empty()).then_some(token)
}

/// Extract the client IP with CDN headers taking priority over the peer address.
///
/// On comma-separated forwarded values the first element wins.
pub fn client_ip(headers: &HeaderMap, peer: Option<&str>) -> String {
    for name in ["cf-connecting-ip", "x-forwarded-for"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if let Some(first) = value.split(',').next() {
                let trimmed = first.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
    }
    peer.unwrap_or("unknown").to_string()
}

/// Resolves requests to identities, with graceful degradation and caching.
pub struct AuthResolver {
    store: Arc<dyn IdentityApi>,
    cache: Cache<String, Identity>,
}

impl AuthResolver {
    /// Build a resolver over the identity store.
    pub fn new(store: Arc<dyn IdentityApi>) -> Self {
        Self {
            store,
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(CACHE_TTL)
                .build(),
        }
    }

    /// Resolve the request to an identity. Never fails; the worst case is anonymous.
    pub async fn resolve(&self, authorization: Option<&str>, ip: &str) -> Identity {
        if let Some(token) = authorization.and_then(bearer_token) {
            let cache_key = format!("tok:{token}");
            if let Some(identity) = self.cache.get(&cache_key).await {
                return identity;
            }
            match self.store.validate_token(token).await {
                Ok(TokenLookup::Valid(record)) => {
                    let identity = authenticated(record, token.to_string());
                    self.cache.insert(cache_key, identity.clone()).await;
                    return identity;
                }
                Ok(TokenLookup::FormatInvalid) => {
                    tracing::warn!(ip, "Malformed bearer token; falling back to IP resolution");
                }
                Ok(TokenLookup::NotFound) => {
                    tracing::warn!(ip, "Unknown bearer token; falling back to IP resolution");
                }
                Err(err) => {
                    tracing::warn!(error = %err, ip, "Token validation failed; falling back");
                }
            }
        }

        let cache_key = format!("ip:{ip}");
        if let Some(identity) = self.cache.get(&cache_key).await {
            return identity;
        }
        match self.store.resolve_ip(ip).await {
            Ok(Some(record)) => {
                let identity = authenticated(record, IP_BASED_TOKEN.to_string());
                self.cache.insert(cache_key, identity.clone()).await;
                identity
            }
            Ok(None) => Identity::Anonymous { ip: ip.to_string() },
            Err(err) => {
                tracing::warn!(error = %err, ip, "IP resolution failed; treating as anonymous");
                Identity::Anonymous { ip: ip.to_string() }
            }
        }
    }
}

fn authenticated(record: UserRecord, token: String) -> Identity {
    Identity::Authenticated(UserIdentity {
        user_id: record.user_id,
        email: record.email,
        plan: record.plan,
        token,
    })
}
