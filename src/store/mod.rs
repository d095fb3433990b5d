//! Postgres-backed storage adapters.
//!
//! Two adapters share one connection pool: [`corpus`] reads the chunk and page tables that an
//! external ingestion pipeline populates, and [`identity`] resolves credentials, enforces rate
//! counters, and records usage logs. The pool is bounded and shared across all workers; both
//! adapters surface failures through [`StoreError`] so callers can tell transient connection
//! trouble apart from schema-level mismatches.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::config::get_config;

pub mod corpus;
pub mod identity;
pub mod writeback;

/// Errors produced by the storage adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection-level fault that is safe to retry.
    #[error("transient storage failure: {0}")]
    Transient(#[source] sqlx::Error),
    /// Schema or protocol mismatch; retrying will not help.
    #[error("storage failure: {0}")]
    Fatal(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_) => Self::Transient(err),
            _ => Self::Fatal(err),
        }
    }
}

impl StoreError {
    /// Whether the underlying fault is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Build the shared Postgres pool from the loaded configuration.
pub async fn connect_pool() -> Result<PgPool, sqlx::Error> {
    let config = get_config();
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .acquire_timeout(Duration::from_secs(config.database_connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database_idle_timeout_secs))
        .connect(&config.database_url)
        .await?;
    tracing::debug!(
        max_connections = config.database_max_connections,
        "Connected Postgres pool"
    );
    Ok(pool)
}
