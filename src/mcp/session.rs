//! Session registry and connection health tracking.
//!
//! Sessions are optional: the registry is only consulted when the deployment enables them
//! and the client echoes an `Mcp-Session-Id`. A session expires after 24 hours of age or
//! 2 hours of inactivity; once bound to an identity it only accepts requests from that same
//! identity. Clients that never present a session id are treated as implicitly initialized.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

/// Maximum session age.
const MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
/// Maximum inactivity before expiry.
const MAX_IDLE: Duration = Duration::from_secs(2 * 60 * 60);
/// Smoothing factor for the ping-interval EMA.
const PING_EMA_ALPHA: f64 = 0.2;

/// Health sub-record updated by `ping`.
#[derive(Debug, Clone, Default)]
pub struct ConnectionHealth {
    /// Number of pings observed on this session.
    pub ping_count: u64,
    /// Exponential moving average of the interval between pings, in milliseconds.
    pub ema_interval_ms: Option<f64>,
    /// When the last ping arrived.
    pub last_pong: Option<Instant>,
}

/// One tracked session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque identifier issued to the client.
    pub id: String,
    /// Protocol version negotiated at `initialize`.
    pub protocol_version: String,
    /// Identity bound on the first `notifications/initialized`.
    pub identity_key: Option<String>,
    /// Whether `notifications/initialized` has been observed.
    pub initialized: bool,
    /// Creation time.
    pub created_at: Instant,
    /// Last request touching this session.
    pub last_activity: Instant,
    /// Ping-derived health record.
    pub health: ConnectionHealth,
}

impl Session {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= MAX_AGE
            || now.duration_since(self.last_activity) >= MAX_IDLE
    }
}

/// How a presented session id relates to the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionGate {
    /// No session id presented (or sessions disabled); implicitly initialized.
    Stateless,
    /// Session exists, is initialized, and matches the identity.
    Ready,
    /// Session exists but has not completed the initialize handshake,
    /// or is bound to a different identity.
    NotInitialized,
    /// Unknown or expired session id.
    Expired,
}

/// Process-wide session table.
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    enabled: bool,
}

impl SessionRegistry {
    /// Create a registry; when `enabled` is false every request is stateless.
    pub fn new(enabled: bool) -> Self {
        Self {
            sessions: DashMap::new(),
            enabled,
        }
    }

    /// Whether the transport should issue session ids at all.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Create a session for a fresh `initialize` and return its id.
    pub fn create(&self, protocol_version: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let id = Uuid::new_v4().to_string();
        let now = Instant::now();
        self.sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                protocol_version: protocol_version.to_string(),
                identity_key: None,
                initialized: false,
                created_at: now,
                last_activity: now,
                health: ConnectionHealth::default(),
            },
        );
        tracing::debug!(session = %id, protocol_version, "Session created");
        Some(id)
    }

    /// Gate a request against its presented session id, refreshing activity on success.
    pub fn gate(&self, session_id: Option<&str>, identity_key: &str) -> SessionGate {
        if !self.enabled {
            return SessionGate::Stateless;
        }
        let Some(id) = session_id else {
            return SessionGate::Stateless;
        };
        let now = Instant::now();
        let Some(mut session) = self.sessions.get_mut(id) else {
            return SessionGate::Expired;
        };
        if session.expired(now) {
            drop(session);
            self.sessions.remove(id);
            return SessionGate::Expired;
        }
        if !session.initialized {
            return SessionGate::NotInitialized;
        }
        if let Some(bound) = &session.identity_key {
            if bound != identity_key {
                tracing::warn!(session = %id, "Session identity mismatch");
                return SessionGate::NotInitialized;
            }
        }
        session.last_activity = now;
        SessionGate::Ready
    }

    /// Mark the session initialized and bind it to `identity_key` on first receipt.
    pub fn mark_initialized(&self, session_id: &str, identity_key: &str) -> bool {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        session.initialized = true;
        session.last_activity = Instant::now();
        if session.identity_key.is_none() {
            session.identity_key = Some(identity_key.to_string());
        }
        true
    }

    /// Update the health record for a `ping`.
    pub fn record_ping(&self, session_id: &str) {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return;
        };
        let now = Instant::now();
        if let Some(last) = session.health.last_pong {
            let interval_ms = now.duration_since(last).as_millis() as f64;
            session.health.ema_interval_ms = Some(match session.health.ema_interval_ms {
                Some(ema) => PING_EMA_ALPHA * interval_ms + (1.0 - PING_EMA_ALPHA) * ema,
                None => interval_ms,
            });
        }
        session.health.last_pong = Some(now);
        session.health.ping_count += 1;
        session.last_activity = now;
    }

    /// Drop a session explicitly (transport `DELETE`).
    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Drop every expired session; returns how many were removed.
    pub fn expire_stale(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.expired(now));
        let removed = before - self.sessions.len();
        if removed > 0 {
            tracing::debug!(removed, "Expired sessions");
        }
        removed
    }

    /// Read a session's health record (for tests and diagnostics).
    pub fn health(&self, session_id: &str) -> Option<ConnectionHealth> {
        self.sessions
            .get(session_id)
            .map(|session| session.health.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_registry_is_always_stateless() {
        let registry = SessionRegistry::new(false);
        assert!(registry.create("2025-03-26").is_none());
        assert_eq!(registry.gate(Some("anything"), "ip:1.1.1.1"), SessionGate::Stateless);
    }

    #[test]
    fn missing_session_header_is_stateless() {
        let registry = SessionRegistry::new(true);
        assert_eq!(registry.gate(None, "ip:1.1.1.1"), SessionGate::Stateless);
    }

    #[test]
    fn unknown_session_is_expired() {
        let registry = SessionRegistry::new(true);
        assert_eq!(
            registry.gate(Some("nope"), "ip:1.1.1.1"),
            SessionGate::Expired
        );
    }

    #[test]
    fn session_requires_initialized_notification() {
        let registry = SessionRegistry::new(true);
        let id = registry.create("2025-03-26").expect("session id");
        assert_eq!(
            registry.gate(Some(&id), "ip:1.1.1.1"),
            SessionGate::NotInitialized
        );

        assert!(registry.mark_initialized(&id, "ip:1.1.1.1"));
        assert_eq!(registry.gate(Some(&id), "ip:1.1.1.1"), SessionGate::Ready);
    }

    #[test]
    fn bound_sessions_reject_other_identities() {
        let registry = SessionRegistry::new(true);
        let id = registry.create("2025-03-26").expect("session id");
        registry.mark_initialized(&id, "user:1");
        assert_eq!(registry.gate(Some(&id), "user:1"), SessionGate::Ready);
        assert_eq!(
            registry.gate(Some(&id), "user:2"),
            SessionGate::NotInitialized
        );
    }

    #[test]
    fn ping_updates_health_counters() {
        let registry = SessionRegistry::new(true);
        let id = registry.create("2025-03-26").expect("session id");
        registry.record_ping(&id);
        registry.record_ping(&id);
        let health = registry.health(&id).expect("health");
        assert_eq!(health.ping_count, 2);
        assert!(health.last_pong.is_some());
        assert!(health.ema_interval_ms.is_some());
    }

    #[test]
    fn explicit_remove_forgets_the_session() {
        let registry = SessionRegistry::new(true);
        let id = registry.create("2025-03-26").expect("session id");
        assert!(registry.remove(&id));
        assert_eq!(registry.gate(Some(&id), "x"), SessionGate::Expired);
    }
}
