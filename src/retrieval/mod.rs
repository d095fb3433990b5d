//! Hybrid retrieval engine.
//!
//! One query fans out to dense-vector and lexical candidate retrieval in parallel, the union
//! is deduplicated and merged (context groups, then small-document packing), and a
//! cross-encoder reranker picks the final ordering. Candidate retrieval over-fetches at
//! four times the requested count per branch so the reranker has a meaningful pool to
//! choose from.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::get_config;
use crate::embedding::{EmbeddingApi, EmbeddingError};
use crate::rerank::{RerankApi, RerankError};
use crate::store::StoreError;
use crate::store::corpus::CorpusApi;

pub mod merge;

use merge::{ProcessedResult, RawChunk, dedup_chunks, merge_by_context, merge_small_documents};

/// Hard ceiling on ranked results per query.
pub const MAX_RESULTS: usize = 50;
/// Over-fetch multiplier applied per retrieval branch.
const CANDIDATE_MULTIPLIER: usize = 4;
/// Cap on the additional-URLs list.
const MAX_ADDITIONAL_URLS: usize = 10;

/// Errors escaping the retrieval engine.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Embedding the query failed.
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
    /// Candidate retrieval failed.
    #[error("corpus search failed: {0}")]
    Store(#[from] StoreError),
    /// Reranking failed.
    #[error("rerank failed: {0}")]
    Rerank(#[from] RerankError),
}

/// One entry of the final ranked list.
#[derive(Debug, Clone)]
pub struct RankedResult {
    /// The merged retrieval unit.
    pub result: ProcessedResult,
    /// Reranker relevance score.
    pub score: f32,
}

/// Outcome of a search: the ranked list plus leftover source URLs.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    /// At most the requested number of results, best first.
    pub ranked: Vec<RankedResult>,
    /// URLs of merged candidates that did not make the ranked list.
    pub additional_urls: Vec<String>,
}

/// Interface the tool executors program against.
#[async_trait]
pub trait RetrievalApi: Send + Sync {
    /// Run the full pipeline for `query`, returning at most `requested` ranked results.
    async fn search(&self, query: &str, requested: usize)
    -> Result<SearchOutcome, RetrievalError>;
}

/// Production engine wired to the corpus store and the external scoring services.
pub struct HybridRetrievalEngine {
    corpus: Arc<dyn CorpusApi>,
    embedding: Arc<dyn EmbeddingApi>,
    rerank: Arc<dyn RerankApi>,
}

impl HybridRetrievalEngine {
    /// Wire the engine to its collaborators.
    pub fn new(
        corpus: Arc<dyn CorpusApi>,
        embedding: Arc<dyn EmbeddingApi>,
        rerank: Arc<dyn RerankApi>,
    ) -> Self {
        Self {
            corpus,
            embedding,
            rerank,
        }
    }
}

#[async_trait]
impl RetrievalApi for HybridRetrievalEngine {
    async fn search(
        &self,
        query: &str,
        requested: usize,
    ) -> Result<SearchOutcome, RetrievalError> {
        let n = requested.clamp(1, MAX_RESULTS);
        let k = n * CANDIDATE_MULTIPLIER;

        // Both branches run concurrently; the first failure cancels the other, and either
        // failing is fatal to the request.
        let (vector_hits, keyword_hits) = tokio::try_join!(
            async {
                let vector = self.embedding.embed(query).await?;
                self.corpus
                    .vector_search(&vector, k)
                    .await
                    .map_err(RetrievalError::from)
            },
            async {
                self.corpus
                    .keyword_search(query, k)
                    .await
                    .map_err(RetrievalError::from)
            }
        )?;

        let mut candidates: Vec<RawChunk> = Vec::with_capacity(vector_hits.len() + keyword_hits.len());
        candidates.extend(vector_hits.into_iter().map(|hit| RawChunk {
            id: hit.id,
            url: hit.url,
            content: hit.content,
        }));
        candidates.extend(keyword_hits.into_iter().map(|hit| RawChunk {
            id: hit.id,
            url: hit.url,
            content: hit.content,
        }));

        let deduped = dedup_chunks(candidates);
        let grouped = merge_by_context(deduped);
        let threshold = get_config().small_document_threshold;
        let processed = merge_small_documents(grouped, threshold);
        if processed.is_empty() {
            return Ok(SearchOutcome::default());
        }

        // The reranker sees every merged candidate; truncation happens via top_n only.
        let documents: Vec<String> = processed
            .iter()
            .map(|result| result.content.clone())
            .collect();
        let top_n = n.min(processed.len());
        let mut hits = self.rerank.rerank(query, &documents, top_n).await?;
        hits.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.original_index.cmp(&b.original_index))
        });

        let mut ranked = Vec::with_capacity(hits.len());
        for hit in hits.into_iter().take(n) {
            ranked.push(RankedResult {
                result: processed[hit.original_index].clone(),
                score: hit.relevance_score,
            });
        }

        let ranked_urls: Vec<&str> = ranked
            .iter()
            .map(|entry| entry.result.url.as_str())
            .collect();
        let mut additional_urls = Vec::new();
        for result in &processed {
            if ranked_urls.contains(&result.url.as_str()) {
                continue;
            }
            if additional_urls.iter().any(|url| url == &result.url) {
                continue;
            }
            additional_urls.push(result.url.clone());
            if additional_urls.len() == MAX_ADDITIONAL_URLS {
                break;
            }
        }

        tracing::debug!(
            requested = n,
            candidates = documents.len(),
            ranked = ranked.len(),
            additional = additional_urls.len(),
            "Hybrid retrieval completed"
        );
        Ok(SearchOutcome {
            ranked,
            additional_urls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::ensure_test_config;
    use crate::rerank::RerankHit;
    use crate::store::corpus::{KeywordHit, Page, VectorHit};
    use std::sync::Mutex;

    struct StubCorpus {
        vector: Vec<VectorHit>,
        keyword: Vec<KeywordHit>,
        seen_k: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl CorpusApi for StubCorpus {
        async fn vector_search(
            &self,
            _query_vector: &[f32],
            k: usize,
        ) -> Result<Vec<VectorHit>, StoreError> {
            self.seen_k.lock().expect("lock").push(k);
            Ok(self.vector.clone())
        }

        async fn keyword_search(
            &self,
            _query_text: &str,
            k: usize,
        ) -> Result<Vec<KeywordHit>, StoreError> {
            self.seen_k.lock().expect("lock").push(k);
            Ok(self.keyword.clone())
        }

        async fn page_by_url(&self, _url: &str) -> Result<Option<Page>, StoreError> {
            Ok(None)
        }
    }

    struct StubEmbedding;

    #[async_trait]
    impl EmbeddingApi for StubEmbedding {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0, 0.0, 0.0, 0.0])
        }
    }

    /// Scores documents by descending original index so ordering is observable.
    struct ReverseRerank;

    #[async_trait]
    impl RerankApi for ReverseRerank {
        async fn rerank(
            &self,
            _query: &str,
            documents: &[String],
            top_n: usize,
        ) -> Result<Vec<RerankHit>, RerankError> {
            let mut hits: Vec<RerankHit> = documents
                .iter()
                .enumerate()
                .map(|(index, _)| RerankHit {
                    original_index: index,
                    relevance_score: index as f32,
                })
                .collect();
            hits.sort_by(|a, b| b.original_index.cmp(&a.original_index));
            hits.truncate(top_n);
            Ok(hits)
        }
    }

    fn vector_hit(id: &str, url: &str, content: &str) -> VectorHit {
        VectorHit {
            id: id.into(),
            url: url.into(),
            content: content.into(),
            similarity: 0.9,
        }
    }

    fn keyword_hit(id: &str, url: &str, content: &str) -> KeywordHit {
        KeywordHit {
            id: id.into(),
            url: url.into(),
            content: content.into(),
        }
    }

    fn engine(corpus: StubCorpus) -> HybridRetrievalEngine {
        HybridRetrievalEngine::new(
            Arc::new(corpus),
            Arc::new(StubEmbedding),
            Arc::new(ReverseRerank),
        )
    }

    #[tokio::test]
    async fn overlapping_candidates_are_deduplicated() {
        ensure_test_config();
        // 6 vector + 6 keyword candidates, 4 overlapping ids => 8 distinct.
        let body = "x".repeat(1600);
        let vector = (0..6)
            .map(|i| vector_hit(&format!("c{i}"), &format!("https://d.example/{i}"), &body))
            .collect();
        let keyword = (2..8)
            .map(|i| keyword_hit(&format!("c{i}"), &format!("https://d.example/{i}"), &body))
            .collect();
        let corpus = StubCorpus {
            vector,
            keyword,
            seen_k: Mutex::new(Vec::new()),
        };
        let engine = engine(corpus);

        let outcome = engine.search("SwiftUI navigation", 3).await.expect("search");
        assert_eq!(outcome.ranked.len(), 3);
        // 8 distinct candidates minus 3 ranked leaves at most 5 additional URLs.
        assert!(outcome.additional_urls.len() <= 5);
        // Ranked and additional URL sets are disjoint.
        for entry in &outcome.ranked {
            assert!(!outcome.additional_urls.contains(&entry.result.url));
        }
    }

    #[tokio::test]
    async fn requested_count_is_clamped_and_drives_overfetch() {
        ensure_test_config();
        let corpus = Arc::new(StubCorpus {
            vector: vec![vector_hit("a", "https://d.example/a", &"x".repeat(1600))],
            keyword: vec![],
            seen_k: Mutex::new(Vec::new()),
        });
        let engine = HybridRetrievalEngine::new(
            corpus.clone(),
            Arc::new(StubEmbedding),
            Arc::new(ReverseRerank),
        );

        let outcome = engine.search("q", 999).await.expect("search");
        assert_eq!(outcome.ranked.len(), 1);
        // Requested 999 clamps to 50, and each branch over-fetches four times that.
        let seen = corpus.seen_k.lock().expect("lock").clone();
        assert!(seen.iter().all(|&k| k == 200));
    }

    #[tokio::test]
    async fn rerank_order_is_descending_with_index_tiebreak() {
        ensure_test_config();
        let body = "x".repeat(1600);
        let corpus = StubCorpus {
            vector: (0..4)
                .map(|i| vector_hit(&format!("c{i}"), &format!("https://d.example/{i}"), &body))
                .collect(),
            keyword: vec![],
            seen_k: Mutex::new(Vec::new()),
        };
        let engine = engine(corpus);

        let outcome = engine.search("q", 4).await.expect("search");
        let scores: Vec<f32> = outcome.ranked.iter().map(|r| r.score).collect();
        let mut sorted = scores.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).expect("ordered"));
        assert_eq!(scores, sorted);
        assert_eq!(outcome.ranked[0].result.id, "c3");
    }

    #[tokio::test]
    async fn empty_candidate_pool_short_circuits() {
        ensure_test_config();
        let corpus = StubCorpus {
            vector: vec![],
            keyword: vec![],
            seen_k: Mutex::new(Vec::new()),
        };
        let engine = engine(corpus);
        let outcome = engine.search("nothing matches", 5).await.expect("search");
        assert!(outcome.ranked.is_empty());
        assert!(outcome.additional_urls.is_empty());
    }

    #[tokio::test]
    async fn additional_urls_are_unique_and_capped() {
        ensure_test_config();
        let body = "x".repeat(1600);
        // 20 distinct URLs, requesting 1 result: at most 10 additional URLs remain.
        let vector = (0..20)
            .map(|i| vector_hit(&format!("c{i}"), &format!("https://d.example/{i}"), &body))
            .collect();
        let corpus = StubCorpus {
            vector,
            keyword: vec![],
            seen_k: Mutex::new(Vec::new()),
        };
        let engine = engine(corpus);

        let outcome = engine.search("q", 1).await.expect("search");
        assert_eq!(outcome.ranked.len(), 1);
        assert_eq!(outcome.additional_urls.len(), 10);
        let mut unique = outcome.additional_urls.clone();
        unique.dedup();
        assert_eq!(unique.len(), outcome.additional_urls.len());
    }
}
