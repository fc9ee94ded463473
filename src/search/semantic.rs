//! Semantic search
//!
//! Embeds the query through the AI manager, then either asks the external
//! vector store for nearest neighbors and hydrates memories in one batch,
//! or, without a vector store, scans stored embedding blobs with cosine
//! similarity under the same filters.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::ai::{cosine_similarity, AiManager};
use crate::error::{MycelicError, Result};
use crate::storage::queries::{
    self, apply_filters, embedding_from_blob, memory_from_row, MEMORY_COLUMNS,
};
use crate::storage::Storage;
use crate::types::*;

/// Check the post-fetch filters a vector hit must still satisfy
fn passes_filters(memory: &Memory, filters: &SearchFilters) -> bool {
    if let Some(ref session_id) = filters.session_id {
        if memory.session_id.as_deref() != Some(session_id.as_str()) {
            return false;
        }
    }
    if let Some(ref domain) = filters.domain {
        if memory.domain.as_deref() != Some(domain.as_str()) {
            return false;
        }
    }
    if let Some(min_importance) = filters.min_importance {
        if memory.importance < min_importance {
            return false;
        }
    }
    if let Some(after) = filters.created_after {
        if memory.created_at < after {
            return false;
        }
    }
    if let Some(before) = filters.created_before {
        if memory.created_at > before {
            return false;
        }
    }
    if let Some(ref tags) = filters.tags {
        for tag in tags {
            if !memory.tags.contains(tag) {
                return false;
            }
        }
    }
    true
}

/// Semantic search entry point
#[allow(clippy::too_many_arguments)]
pub async fn semantic_search(
    storage: &Storage,
    ai: &Arc<AiManager>,
    query: &str,
    limit: i64,
    offset: i64,
    options: &SearchOptions,
    cancel: &CancellationToken,
) -> Result<Vec<SearchResult>> {
    let query_embedding = ai.embed(query, cancel).await?;

    let mut results = if ai.has_vector_store() {
        vector_store_search(storage, ai, &query_embedding, limit + offset, options).await?
    } else {
        local_scan_search(storage, &query_embedding, limit + offset, options).await?
    };

    if (offset as usize) < results.len() {
        results = results.split_off(offset as usize);
    } else {
        results.clear();
    }
    results.truncate(limit as usize);
    Ok(results)
}

/// Top-k from the vector store, hydrated in one batch fetch
async fn vector_store_search(
    storage: &Storage,
    ai: &Arc<AiManager>,
    query_embedding: &[f32],
    k: i64,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    // Over-fetch so post-filter still fills the page
    let hits = ai.vector_search(query_embedding, (k * 3).max(10) as usize).await?;
    if hits.is_empty() {
        return Ok(vec![]);
    }

    let ids: Vec<MemoryId> = hits.iter().map(|h| h.memory_id).collect();
    let storage = storage.clone();
    let memories = tokio::task::spawn_blocking(move || {
        storage.with_reader(|conn| queries::get_memories_by_ids(conn, &ids))
    })
    .await
    .map_err(|e| MycelicError::Internal(format!("semantic fetch task failed: {}", e)))??;

    let results = hits
        .into_iter()
        .filter_map(|hit| {
            let memory = memories.iter().find(|m| m.id == hit.memory_id)?.clone();
            if !passes_filters(&memory, &options.filters) {
                return None;
            }
            Some(SearchResult {
                memory,
                relevance: hit.score.clamp(0.0, 1.0),
                match_type: MatchType::Semantic,
            })
        })
        .collect();
    Ok(results)
}

/// Fallback: scan stored embedding blobs under the reader gate
async fn local_scan_search(
    storage: &Storage,
    query_embedding: &[f32],
    k: i64,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    let storage = storage.clone();
    let query_embedding = query_embedding.to_vec();
    let options = options.clone();

    tokio::task::spawn_blocking(move || {
        storage.with_reader(|conn| {
            let mut sql = format!(
                "SELECT {}, m.embedding AS embedding_blob
                 FROM memories m WHERE m.embedding IS NOT NULL",
                MEMORY_COLUMNS
            );
            let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            apply_filters(&mut sql, &mut params, &options.filters);

            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn rusqlite::ToSql> =
                params.iter().map(|b| b.as_ref()).collect();

            let mut scored: Vec<SearchResult> = stmt
                .query_map(param_refs.as_slice(), |row| {
                    let memory = memory_from_row(row)?;
                    let blob: Vec<u8> = row.get("embedding_blob")?;
                    Ok((memory, blob))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?
                .into_iter()
                .map(|(memory, blob)| {
                    let embedding = embedding_from_blob(&blob);
                    let score = cosine_similarity(&query_embedding, &embedding) as f64;
                    SearchResult {
                        memory,
                        relevance: score.clamp(0.0, 1.0),
                        match_type: MatchType::Semantic,
                    }
                })
                .collect();

            scored.sort_by(|a, b| {
                b.relevance
                    .partial_cmp(&a.relevance)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.memory.id.cmp(&b.memory.id))
            });
            scored.truncate(k as usize);
            Ok(scored)
        })
    })
    .await
    .map_err(|e| MycelicError::Internal(format!("semantic scan task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{EmbeddingCache, HashEmbedder, MemoryVectorStore};
    use crate::storage::queries::{insert_memory, store_embedding, NewMemory};
    use std::time::Duration;

    fn mem(content: &str) -> NewMemory {
        NewMemory {
            content: content.to_string(),
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
        }
    }

    fn ai_with_store(store: bool) -> Arc<AiManager> {
        Arc::new(AiManager::with_providers(
            Arc::new(HashEmbedder::default()),
            if store {
                Some(Arc::new(MemoryVectorStore::new()))
            } else {
                None
            },
            None,
            Arc::new(EmbeddingCache::memory_only(64, Duration::from_secs(60))),
        ))
    }

    async fn seed(storage: &Storage, ai: &Arc<AiManager>, contents: &[&str]) -> Vec<MemoryId> {
        let cancel = CancellationToken::new();
        let mut ids = Vec::new();
        for content in contents {
            let id = storage
                .with_writer(|conn| insert_memory(conn, &mem(content)))
                .unwrap();
            ai.embed_and_store(storage, id, content, &cancel)
                .await
                .unwrap();
            ids.push(id);
        }
        ids
    }

    #[tokio::test]
    async fn test_vector_store_path_ranks_related_first() {
        let storage = Storage::open_in_memory().unwrap();
        let ai = ai_with_store(true);
        let ids = seed(
            &storage,
            &ai,
            &[
                "concurrency with channels and goroutines",
                "array slicing syntax in python",
            ],
        )
        .await;

        let cancel = CancellationToken::new();
        let results = semantic_search(
            &storage,
            &ai,
            "goroutines and channels",
            10,
            0,
            &SearchOptions::default(),
            &cancel,
        )
        .await
        .unwrap();

        assert!(!results.is_empty());
        assert_eq!(results[0].memory.id, ids[0]);
        assert_eq!(results[0].match_type, MatchType::Semantic);
    }

    #[tokio::test]
    async fn test_local_scan_fallback() {
        let storage = Storage::open_in_memory().unwrap();
        let ai = ai_with_store(false);
        let embedder = HashEmbedder::default();

        let id = storage
            .with_writer(|conn| insert_memory(conn, &mem("borrow checker rules")))
            .unwrap();
        storage
            .with_writer(|conn| {
                store_embedding(
                    conn,
                    id,
                    &embedder.embed_sync("borrow checker rules"),
                    "hash-fallback",
                    "memories",
                )
            })
            .unwrap();

        let cancel = CancellationToken::new();
        let results = semantic_search(
            &storage,
            &ai,
            "borrow checker",
            10,
            0,
            &SearchOptions::default(),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.id, id);
        assert!(results[0].relevance > 0.0);
    }

    #[tokio::test]
    async fn test_filters_apply_to_vector_hits() {
        let storage = Storage::open_in_memory().unwrap();
        let ai = ai_with_store(true);
        let cancel = CancellationToken::new();

        let id = storage
            .with_writer(|conn| {
                let mut m = mem("kubernetes deployment strategies");
                m.domain = Some("devops".into());
                insert_memory(conn, &m)
            })
            .unwrap();
        ai.embed_and_store(&storage, id, "kubernetes deployment strategies", &cancel)
            .await
            .unwrap();

        let mut options = SearchOptions::default();
        options.filters.domain = Some("cooking".into());
        let results = semantic_search(
            &storage,
            &ai,
            "kubernetes",
            10,
            0,
            &options,
            &cancel,
        )
        .await
        .unwrap();
        assert!(results.is_empty());
    }
}
