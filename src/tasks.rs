//! Background maintenance scheduler.
//!
//! One long-lived task drives every periodic sweep from a single monotonic ticker instead of
//! per-entry timers: inflight requests are expired every minute, and sessions plus progress
//! claims every fifth tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::mcp::server::McpServer;

/// Base tick interval.
const TICK: Duration = Duration::from_secs(60);
/// Session and progress sweeps run every this many ticks.
const SLOW_SWEEP_EVERY: u64 = 5;

/// Spawn the cleanup loop; the handle is held for the process lifetime.
pub fn spawn_cleanup(server: Arc<McpServer>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICK);
        ticker.tick().await;
        let mut tick: u64 = 0;
        loop {
            ticker.tick().await;
            tick += 1;

            let expired_requests = server.inflight.expire();
            if expired_requests > 0 {
                tracing::debug!(expired_requests, "Expired inflight requests");
            }

            if tick % SLOW_SWEEP_EVERY == 0 {
                let expired_sessions = server.sessions.expire_stale();
                let expired_progress = server.progress.expire();
                if expired_sessions > 0 || expired_progress > 0 {
                    tracing::debug!(
                        expired_sessions,
                        expired_progress,
                        "Expired sessions and progress claims"
                    );
                }
            }
        }
    })
}
