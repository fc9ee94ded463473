//! Search engine: keyword, semantic, and hybrid modes
//!
//! Keyword search goes through the FTS5 index with BM25 ranking mapped into
//! a [0, 1] relevance. Semantic search embeds the query and asks the vector
//! store (or falls back to scanning stored embeddings). Hybrid fans both
//! out in parallel and merges with a weighted sum.

pub mod hybrid;
pub mod keyword;
pub mod semantic;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::ai::AiManager;
use crate::error::{MycelicError, Result};
use crate::storage::Storage;
use crate::types::*;

/// Tunables for ranking and merging
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Divisor in `relevance = clamp(1 + bm25/divisor, 0, 1)`
    pub bm25_divisor: f64,
    pub keyword_weight: f64,
    pub semantic_weight: f64,
    /// Results below this combined relevance are dropped
    pub min_relevance: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            bm25_divisor: 10.0,
            keyword_weight: 0.4,
            semantic_weight: 0.6,
            min_relevance: 0.1,
        }
    }
}

/// Front door for all search modes
#[derive(Clone)]
pub struct SearchEngine {
    storage: Storage,
    ai: Option<Arc<AiManager>>,
    config: SearchConfig,
}

impl SearchEngine {
    pub fn new(storage: Storage, ai: Option<Arc<AiManager>>, config: SearchConfig) -> Self {
        Self {
            storage,
            ai,
            config,
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Run a search in the requested mode with pagination
    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
        cancel: &CancellationToken,
    ) -> Result<SearchResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MycelicError::invalid("query", "must not be empty"));
        }

        let limit = options.limit.unwrap_or(10).max(1);
        let offset = options.offset.unwrap_or(0).max(0);
        let started = std::time::Instant::now();

        let response = match options.mode {
            SearchMode::Keyword => {
                // One extra row answers hasNextPage without a count query
                let mut results = self.keyword(query, limit + 1, offset, options).await?;
                let has_next = results.len() as i64 > limit;
                results.truncate(limit as usize);
                Ok(SearchResponse {
                    results,
                    has_next_page: has_next,
                    has_previous_page: offset > 0,
                    warnings: vec![],
                })
            }
            SearchMode::Semantic => {
                let mut results = self
                    .semantic(query, limit + 1, offset, options, cancel)
                    .await?;
                let has_next = results.len() as i64 > limit;
                results.truncate(limit as usize);
                Ok(SearchResponse {
                    results,
                    has_next_page: has_next,
                    has_previous_page: offset > 0,
                    warnings: vec![],
                })
            }
            SearchMode::Hybrid => {
                hybrid::hybrid_search(self, query, limit, offset, options, cancel).await
            }
        }?;

        let operation = match options.mode {
            SearchMode::Keyword => "search.keyword",
            SearchMode::Semantic => "search.semantic",
            SearchMode::Hybrid => "search.hybrid",
        };
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        if let Err(e) = self.storage.with_writer(|conn| {
            crate::storage::metrics::record_metric(conn, operation, duration_ms)
        }) {
            tracing::debug!("metric recording failed: {}", e);
        }

        Ok(response)
    }

    pub(crate) async fn keyword(
        &self,
        query: &str,
        limit: i64,
        offset: i64,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        let storage = self.storage.clone();
        let query = query.to_string();
        let options = options.clone();
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || {
            storage.with_reader(|conn| {
                keyword::keyword_search(conn, &query, limit, offset, &options, &config)
            })
        })
        .await
        .map_err(|e| MycelicError::Internal(format!("keyword search task failed: {}", e)))?
    }

    pub(crate) async fn semantic(
        &self,
        query: &str,
        limit: i64,
        offset: i64,
        options: &SearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>> {
        let ai = self
            .ai
            .as_ref()
            .ok_or_else(|| MycelicError::Unavailable("AI manager not configured".to_string()))?;
        semantic::semantic_search(&self.storage, ai, query, limit, offset, options, cancel).await
    }
}

/// Paging math shared by the REST front-end
pub fn total_pages(total: i64, per_page: i64) -> i64 {
    if per_page <= 0 {
        return 0;
    }
    (total + per_page - 1) / per_page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_pages_rounds_up() {
        assert_eq!(total_pages(0, 10), 0);
        assert_eq!(total_pages(1, 10), 1);
        assert_eq!(total_pages(10, 10), 1);
        assert_eq!(total_pages(11, 10), 2);
        assert_eq!(total_pages(5, 0), 0);
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let engine = SearchEngine::new(
            Storage::open_in_memory().unwrap(),
            None,
            SearchConfig::default(),
        );
        let err = engine
            .search("  ", &SearchOptions::default(), &CancellationToken::new())
            .await;
        assert!(matches!(err, Err(MycelicError::InvalidInput { .. })));
    }
}
