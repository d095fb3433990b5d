//! Read-only access to the documentation corpus.
//!
//! The corpus is populated by an external ingestion pipeline; this adapter only reads it.
//! `chunks` rows carry an optional dense embedding (fixed dimension per deployment) and a raw
//! text body, `pages` rows hold the canonical cleaned document per URL.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::postgres::PgPool;

use crate::store::StoreError;

/// Upper bound accepted for the candidate count `k`.
pub const MAX_CANDIDATES: usize = 50;

/// One chunk returned by similarity search.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VectorHit {
    /// Stable chunk identifier.
    pub id: String,
    /// Source URL the chunk was extracted from.
    pub url: String,
    /// Raw chunk body (possibly a structured envelope).
    pub content: String,
    /// Cosine similarity against the query vector, in `[0, 1]`.
    pub similarity: f64,
}

/// One chunk returned by lexical search.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KeywordHit {
    /// Stable chunk identifier.
    pub id: String,
    /// Source URL the chunk was extracted from.
    pub url: String,
    /// Raw chunk body (possibly a structured envelope).
    pub content: String,
}

/// The canonical full document for a URL.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Page {
    /// Stable page identifier.
    pub id: String,
    /// Canonical URL of the document.
    pub url: String,
    /// Full cleaned content.
    pub content: String,
}

/// Read operations over the documentation corpus.
#[async_trait]
pub trait CorpusApi: Send + Sync {
    /// Return the `k` chunks closest to `query_vector`, ranked by cosine similarity.
    async fn vector_search(
        &self,
        query_vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>, StoreError>;

    /// Return up to `k` chunks whose content contains `query_text` case-insensitively.
    async fn keyword_search(
        &self,
        query_text: &str,
        k: usize,
    ) -> Result<Vec<KeywordHit>, StoreError>;

    /// Fetch the stored page for `url`, if any.
    async fn page_by_url(&self, url: &str) -> Result<Option<Page>, StoreError>;
}

/// Postgres-backed corpus adapter.
pub struct CorpusStore {
    pool: PgPool,
}

impl CorpusStore {
    /// Wrap the shared connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CorpusApi for CorpusStore {
    async fn vector_search(
        &self,
        query_vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>, StoreError> {
        let k = k.clamp(1, MAX_CANDIDATES);
        let query = Vector::from(query_vector.to_vec());
        // Chunks without an embedding are excluded; ties fall back to storage order.
        let hits = sqlx::query_as::<_, VectorHit>(
            r"SELECT id, url, content, 1 - (embedding <=> $1) AS similarity
              FROM chunks
              WHERE embedding IS NOT NULL
              ORDER BY embedding <=> $1, id
              LIMIT $2",
        )
        .bind(query)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;
        tracing::debug!(k, hits = hits.len(), "Vector search completed");
        Ok(hits)
    }

    async fn keyword_search(
        &self,
        query_text: &str,
        k: usize,
    ) -> Result<Vec<KeywordHit>, StoreError> {
        let k = k.clamp(1, MAX_CANDIDATES);
        let pattern = format!("%{}%", escape_like_pattern(query_text));
        let hits = sqlx::query_as::<_, KeywordHit>(
            r"SELECT id, url, content
              FROM chunks
              WHERE content ILIKE $1
              ORDER BY id
              LIMIT $2",
        )
        .bind(pattern)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;
        tracing::debug!(k, hits = hits.len(), "Keyword search completed");
        Ok(hits)
    }

    async fn page_by_url(&self, url: &str) -> Result<Option<Page>, StoreError> {
        let page = sqlx::query_as::<_, Page>(
            "SELECT id, url, content FROM pages WHERE url = $1 LIMIT 1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(page)
    }
}

/// Escape `LIKE` metacharacters so user text matches literally.
fn escape_like_pattern(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::escape_like_pattern;

    #[test]
    fn escapes_like_metacharacters() {
        assert_eq!(escape_like_pattern("plain"), "plain");
        assert_eq!(escape_like_pattern("50%_done"), "50\\%\\_done");
        assert_eq!(escape_like_pattern("back\\slash"), "back\\\\slash");
    }
}
