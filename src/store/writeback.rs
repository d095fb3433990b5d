//! Bounded write-behind queue for best-effort persistence.
//!
//! Last-used touches and usage logs must never block or fail a request, so they are enqueued
//! here and drained by a single long-lived worker. The queue is bounded; when it is full the
//! job is dropped with a warning rather than spawning extra work or applying backpressure.

use sqlx::postgres::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::store::identity::{FetchLogEntry, SearchLogEntry};

/// Queue capacity; overflow drops the job.
const QUEUE_CAPACITY: usize = 256;

/// A deferred write applied by the drain worker.
#[derive(Debug)]
pub enum WriteJob {
    /// Refresh `last_used_at` for a bearer token.
    TouchToken {
        /// Token string to touch.
        token: String,
    },
    /// Refresh `last_used_at` for an authorized IP.
    TouchIp {
        /// IP string to touch.
        ip: String,
    },
    /// Append one row to the search log.
    LogSearch(SearchLogEntry),
    /// Append one row to the fetch log.
    LogFetch(FetchLogEntry),
}

/// Handle used to enqueue deferred writes.
#[derive(Clone)]
pub struct WritebackQueue {
    tx: mpsc::Sender<WriteJob>,
}

impl WritebackQueue {
    /// Start the drain worker on `pool` and return the enqueue handle.
    pub fn spawn(pool: PgPool) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(err) = apply(&pool, job).await {
                    tracing::warn!(error = %err, "Write-behind job failed");
                }
            }
        });
        (Self { tx }, handle)
    }

    /// Enqueue a job, dropping it when the queue is full.
    pub fn enqueue(&self, job: WriteJob) {
        if let Err(err) = self.tx.try_send(job) {
            tracing::warn!(error = %err, "Write-behind queue full; dropping job");
        }
    }
}

async fn apply(pool: &PgPool, job: WriteJob) -> Result<(), sqlx::Error> {
    match job {
        WriteJob::TouchToken { token } => {
            sqlx::query("UPDATE access_tokens SET last_used_at = now() WHERE token = $1")
                .bind(token)
                .execute(pool)
                .await?;
        }
        WriteJob::TouchIp { ip } => {
            sqlx::query("UPDATE authorized_ips SET last_used_at = now() WHERE ip = $1")
                .bind(ip)
                .execute(pool)
                .await?;
        }
        WriteJob::LogSearch(entry) => {
            sqlx::query(
                r"INSERT INTO search_logs
                  (identity_key, token, query, result_count, latency_ms, status, error_code, client_ip, created_at)
                  VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())",
            )
            .bind(entry.identity_key)
            .bind(entry.token)
            .bind(entry.query)
            .bind(entry.result_count as i32)
            .bind(entry.latency_ms as i32)
            .bind(entry.status as i32)
            .bind(entry.error_code)
            .bind(entry.client_ip)
            .execute(pool)
            .await?;
        }
        WriteJob::LogFetch(entry) => {
            sqlx::query(
                r"INSERT INTO fetch_logs
                  (identity_key, token, requested_url, actual_url, page_id, latency_ms, status, error_code, client_ip, created_at)
                  VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())",
            )
            .bind(entry.identity_key)
            .bind(entry.token)
            .bind(entry.requested_url)
            .bind(entry.actual_url)
            .bind(entry.page_id)
            .bind(entry.latency_ms as i32)
            .bind(entry.status as i32)
            .bind(entry.error_code)
            .bind(entry.client_ip)
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}
