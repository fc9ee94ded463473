//! Hybrid search: parallel keyword + semantic fan-out with weighted merge
//!
//! Both sub-searches run as separate tasks, each bounded to twice the
//! requested limit, and post their outcome to a small channel. The
//! collector waits for both sides or caller cancellation. Scores combine
//! as `w_kw * kw + w_sem * sem`; a memory present in both sets keeps the
//! sum and becomes a hybrid match. One failed side degrades to the other
//! with a warning; two failed sides surface the first error.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use super::SearchEngine;
use crate::error::{MycelicError, Result};
use crate::types::*;

enum Side {
    Keyword(Result<Vec<SearchResult>>),
    Semantic(Result<Vec<SearchResult>>),
}

pub(super) async fn hybrid_search(
    engine: &SearchEngine,
    query: &str,
    limit: i64,
    offset: i64,
    options: &SearchOptions,
    cancel: &CancellationToken,
) -> Result<SearchResponse> {
    let raw_limit = (limit + offset) * 2;
    let (tx, rx) = async_channel::bounded::<Side>(2);

    // Keyword side
    let kw_options = options.clone();
    let kw_query = query.to_string();
    let kw_tx = tx.clone();
    let kw_engine = engine.clone();
    tokio::spawn(async move {
        let result = kw_engine.keyword(&kw_query, raw_limit, 0, &kw_options).await;
        let _ = kw_tx.send(Side::Keyword(result)).await;
    });

    // Semantic side
    let sem_options = options.clone();
    let sem_query = query.to_string();
    let sem_cancel = cancel.clone();
    let sem_engine = engine.clone();
    tokio::spawn(async move {
        let result = sem_engine
            .semantic(&sem_query, raw_limit, 0, &sem_options, &sem_cancel)
            .await;
        let _ = tx.send(Side::Semantic(result)).await;
    });

    let mut keyword_outcome: Option<Result<Vec<SearchResult>>> = None;
    let mut semantic_outcome: Option<Result<Vec<SearchResult>>> = None;

    while keyword_outcome.is_none() || semantic_outcome.is_none() {
        let side = tokio::select! {
            side = rx.recv() => side.map_err(|_| {
                MycelicError::Internal("hybrid search channel closed".to_string())
            })?,
            _ = cancel.cancelled() => return Err(MycelicError::Cancelled),
        };
        match side {
            Side::Keyword(result) => keyword_outcome = Some(result),
            Side::Semantic(result) => semantic_outcome = Some(result),
        }
    }

    let config = engine.config();
    let mut warnings = Vec::new();

    let (keyword_results, semantic_results) =
        match (keyword_outcome.unwrap(), semantic_outcome.unwrap()) {
            (Ok(kw), Ok(sem)) => (kw, sem),
            (Ok(kw), Err(e)) => {
                if matches!(e, MycelicError::Cancelled) {
                    return Err(e);
                }
                warnings.push(format!("semantic search unavailable: {}", e));
                (kw, vec![])
            }
            (Err(e), Ok(sem)) => {
                if matches!(e, MycelicError::Cancelled) {
                    return Err(e);
                }
                warnings.push(format!("keyword search unavailable: {}", e));
                (vec![], sem)
            }
            (Err(first), Err(_)) => return Err(first),
        };

    let mut merged = merge_weighted(
        keyword_results,
        semantic_results,
        config.keyword_weight,
        config.semantic_weight,
        config.min_relevance,
    );

    let total = merged.len() as i64;
    if (offset as usize) < merged.len() {
        merged = merged.split_off(offset as usize);
    } else {
        merged.clear();
    }
    let has_next = total > offset + limit;
    merged.truncate(limit as usize);

    Ok(SearchResponse {
        results: merged,
        has_next_page: has_next,
        has_previous_page: offset > 0,
        warnings,
    })
}

/// Weighted-sum merge of the two result sets
pub fn merge_weighted(
    keyword: Vec<SearchResult>,
    semantic: Vec<SearchResult>,
    keyword_weight: f64,
    semantic_weight: f64,
    min_relevance: f64,
) -> Vec<SearchResult> {
    struct Merged {
        memory: Memory,
        score: f64,
        in_keyword: bool,
        in_semantic: bool,
    }

    let mut by_id: HashMap<MemoryId, Merged> = HashMap::new();

    for result in keyword {
        by_id.insert(
            result.memory.id,
            Merged {
                memory: result.memory,
                score: keyword_weight * result.relevance,
                in_keyword: true,
                in_semantic: false,
            },
        );
    }

    for result in semantic {
        match by_id.entry(result.memory.id) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                let merged = entry.get_mut();
                // Scores sum when a memory appears on both sides
                merged.score += semantic_weight * result.relevance;
                merged.in_semantic = true;
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(Merged {
                    memory: result.memory,
                    score: semantic_weight * result.relevance,
                    in_keyword: false,
                    in_semantic: true,
                });
            }
        }
    }

    let mut merged: Vec<SearchResult> = by_id
        .into_values()
        .filter(|m| m.score >= min_relevance)
        .map(|m| SearchResult {
            relevance: m.score,
            match_type: match (m.in_keyword, m.in_semantic) {
                (true, true) => MatchType::Hybrid,
                (false, true) => MatchType::Semantic,
                _ => MatchType::Keyword,
            },
            memory: m.memory,
        })
        .collect();

    merged.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.memory.id.cmp(&b.memory.id))
    });
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn memory(id: MemoryId) -> Memory {
        Memory {
            id,
            content: format!("memory {}", id),
            source: None,
            importance: 5,
            tags: vec![],
            session_id: None,
            domain: None,
            agent_type: AgentType::Unknown,
            access_scope: AccessScope::Session,
            slug: None,
            parent_memory_id: None,
            chunk_level: 0,
            chunk_index: None,
            source_id: None,
            external_id: None,
            has_embedding: false,
            access_count: 0,
            last_accessed: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn hit(id: MemoryId, relevance: f64, match_type: MatchType) -> SearchResult {
        SearchResult {
            memory: memory(id),
            relevance,
            match_type,
        }
    }

    #[test]
    fn test_duplicate_scores_sum() {
        let merged = merge_weighted(
            vec![hit(1, 0.8, MatchType::Keyword)],
            vec![hit(1, 0.9, MatchType::Semantic)],
            0.4,
            0.6,
            0.1,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].match_type, MatchType::Hybrid);
        assert!((merged[0].relevance - (0.4 * 0.8 + 0.6 * 0.9)).abs() < 1e-9);
    }

    #[test]
    fn test_single_side_keeps_type() {
        let merged = merge_weighted(
            vec![hit(1, 0.8, MatchType::Keyword)],
            vec![hit(2, 0.9, MatchType::Semantic)],
            0.4,
            0.6,
            0.1,
        );
        assert_eq!(merged.len(), 2);
        let first = &merged[0];
        // Semantic side wins: 0.6*0.9 > 0.4*0.8
        assert_eq!(first.memory.id, 2);
        assert_eq!(first.match_type, MatchType::Semantic);
        assert_eq!(merged[1].match_type, MatchType::Keyword);
    }

    #[test]
    fn test_floor_drops_weak_results() {
        let merged = merge_weighted(
            vec![hit(1, 0.1, MatchType::Keyword)],
            vec![],
            0.4,
            0.6,
            0.1,
        );
        assert!(merged.is_empty(), "0.4 * 0.1 = 0.04 is below the floor");
    }

    #[test]
    fn test_empty_sides_empty_result() {
        assert!(merge_weighted(vec![], vec![], 0.4, 0.6, 0.1).is_empty());
    }

    #[test]
    fn test_deterministic_tie_break_by_id() {
        let merged = merge_weighted(
            vec![hit(2, 0.5, MatchType::Keyword), hit(1, 0.5, MatchType::Keyword)],
            vec![],
            0.4,
            0.6,
            0.1,
        );
        assert_eq!(merged[0].memory.id, 1);
        assert_eq!(merged[1].memory.id, 2);
    }
}
