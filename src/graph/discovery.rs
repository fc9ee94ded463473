//! Relationship discovery
//!
//! Proposes edges from a memory to topologically nearby candidates:
//! semantic neighbors plus memories sharing tags or a domain. Each
//! candidate is scored from embedding similarity and textual cues, and
//! candidates above the strength threshold are inserted with
//! `auto_generated = true`. The candidate set is capped, so the cost is
//! O(candidates) embedding lookups and never a full pairwise scan.

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::Connection;
use tokio_util::sync::CancellationToken;

use super::GraphService;
use crate::ai::{cosine_similarity, AiManager};
use crate::error::{MycelicError, Result};
use crate::storage::queries::{self, memory_from_row, MEMORY_COLUMNS};
use crate::storage::Storage;
use crate::types::*;

/// Score weights: embedding similarity dominates, textual cues refine
const WEIGHT_EMBEDDING: f64 = 0.7;
const WEIGHT_TAG_OVERLAP: f64 = 0.2;
const WEIGHT_SAME_DOMAIN: f64 = 0.1;

/// Minimum score for an auto-generated edge
pub const DISCOVERY_THRESHOLD: f64 = 0.6;

/// Upper bound on candidates considered per discovery run
pub const MAX_CANDIDATES: usize = 20;

/// A proposed edge with its score breakdown
#[derive(Debug, Clone)]
pub struct DiscoveredRelationship {
    pub relationship: Relationship,
    pub score: f64,
}

/// Jaccard overlap between two tag sets
fn tag_jaccard(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let set_a: HashSet<&String> = a.iter().collect();
    let set_b: HashSet<&String> = b.iter().collect();
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Memories sharing a tag or domain with the subject
fn tag_domain_candidates(
    conn: &Connection,
    subject: &Memory,
    cap: usize,
) -> Result<Vec<Memory>> {
    let mut sql = format!(
        "SELECT {} FROM memories m
         WHERE m.id != ?1 AND m.parent_memory_id IS NULL AND (",
        MEMORY_COLUMNS
    );
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(subject.id)];
    let mut clauses: Vec<String> = Vec::new();

    if let Some(ref domain) = subject.domain {
        clauses.push("m.domain = ?".into());
        params.push(Box::new(domain.clone()));
    }
    for tag in &subject.tags {
        clauses.push("EXISTS (SELECT 1 FROM json_each(m.tags) je WHERE je.value = ?)".into());
        params.push(Box::new(tag.clone()));
    }
    if clauses.is_empty() {
        return Ok(vec![]);
    }
    sql.push_str(&clauses.join(" OR "));
    sql.push_str(") ORDER BY m.importance DESC LIMIT ?");
    params.push(Box::new(cap as i64));

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
    let memories = stmt
        .query_map(param_refs.as_slice(), memory_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(memories)
}

/// Discover and insert relationships for one memory.
///
/// Returns the edges actually inserted. Existing edges are left untouched;
/// the unique constraint on (source, target, type) makes re-runs no-ops.
pub async fn discover_relationships(
    storage: &Storage,
    graph: &GraphService,
    ai: &Arc<AiManager>,
    memory_id: MemoryId,
    cancel: &CancellationToken,
) -> Result<Vec<DiscoveredRelationship>> {
    let subject = storage
        .with_reader(|conn| queries::get_memory(conn, memory_id))?
        .ok_or_else(|| MycelicError::memory_not_found(memory_id))?;

    let subject_embedding = ai.embed(&subject.content, cancel).await?;

    // Candidate set: semantic neighbors from the vector store plus
    // tag/domain siblings from SQL, capped.
    let mut candidate_ids: Vec<MemoryId> = Vec::new();
    let mut seen: HashSet<MemoryId> = HashSet::new();
    seen.insert(memory_id);

    if ai.has_vector_store() {
        if let Ok(hits) = ai.vector_search(&subject_embedding, MAX_CANDIDATES).await {
            for hit in hits {
                if seen.insert(hit.memory_id) {
                    candidate_ids.push(hit.memory_id);
                }
            }
        }
    }

    let sibling_subject = subject.clone();
    let sibling_storage = storage.clone();
    let siblings = tokio::task::spawn_blocking(move || {
        sibling_storage
            .with_reader(|conn| tag_domain_candidates(conn, &sibling_subject, MAX_CANDIDATES))
    })
    .await
    .map_err(|e| MycelicError::Internal(format!("candidate scan failed: {}", e)))??;

    for sibling in &siblings {
        if seen.insert(sibling.id) {
            candidate_ids.push(sibling.id);
        }
    }
    candidate_ids.truncate(MAX_CANDIDATES);

    let candidates = {
        let storage = storage.clone();
        let ids = candidate_ids.clone();
        tokio::task::spawn_blocking(move || {
            storage.with_reader(|conn| queries::get_memories_by_ids(conn, &ids))
        })
        .await
        .map_err(|e| MycelicError::Internal(format!("candidate fetch failed: {}", e)))??
    };

    let mut discovered = Vec::new();
    for candidate in candidates {
        if cancel.is_cancelled() {
            return Err(MycelicError::Cancelled);
        }

        let candidate_embedding = ai.embed(&candidate.content, cancel).await?;
        let similarity =
            cosine_similarity(&subject_embedding, &candidate_embedding).clamp(0.0, 1.0) as f64;
        let overlap = tag_jaccard(&subject.tags, &candidate.tags);
        let same_domain = match (&subject.domain, &candidate.domain) {
            (Some(a), Some(b)) if a == b => 1.0,
            _ => 0.0,
        };

        let score = WEIGHT_EMBEDDING * similarity
            + WEIGHT_TAG_OVERLAP * overlap
            + WEIGHT_SAME_DOMAIN * same_domain;
        if score < DISCOVERY_THRESHOLD {
            continue;
        }

        let input = CreateRelationshipInput {
            source_memory_id: memory_id,
            target_memory_id: candidate.id,
            relationship_type: RelationshipType::Similar,
            strength: Some(score.min(1.0)),
            context: Some(format!(
                "discovered: similarity {:.2}, tag overlap {:.2}",
                similarity, overlap
            )),
            auto_generated: true,
        };

        match graph.relate(&input) {
            Ok(relationship) => discovered.push(DiscoveredRelationship {
                relationship,
                score,
            }),
            Err(MycelicError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(discovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{EmbeddingCache, HashEmbedder, MemoryVectorStore};
    use crate::memory::{MemoryService, ProcessSessionResolver};
    use std::time::Duration;

    fn fixture() -> (Storage, GraphService, Arc<AiManager>, MemoryService) {
        let storage = Storage::open_in_memory().unwrap();
        let graph = GraphService::new(storage.clone());
        let ai = Arc::new(AiManager::with_providers(
            Arc::new(HashEmbedder::default()),
            Some(Arc::new(MemoryVectorStore::new())),
            None,
            Arc::new(EmbeddingCache::memory_only(64, Duration::from_secs(60))),
        ));
        let service = MemoryService::new(
            storage.clone(),
            Arc::new(ProcessSessionResolver::new()),
            None,
            400,
        );
        (storage, graph, ai, service)
    }

    #[test]
    fn test_tag_jaccard() {
        let a = vec!["rust".to_string(), "async".to_string()];
        let b = vec!["rust".to_string(), "tokio".to_string()];
        assert!((tag_jaccard(&a, &b) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(tag_jaccard(&a, &a), 1.0);
        assert_eq!(tag_jaccard(&a, &[]), 0.0);
        assert_eq!(tag_jaccard(&[], &[]), 0.0);
    }

    #[tokio::test]
    async fn test_discovery_links_near_duplicates() {
        let (storage, graph, ai, service) = fixture();
        let cancel = CancellationToken::new();

        let subject = service
            .store(&CreateMemoryInput {
                content: "tokio spawns lightweight async tasks".into(),
                tags: vec!["rust".into(), "async".into()],
                domain: Some("programming".into()),
                ..Default::default()
            })
            .unwrap();
        let near = service
            .store(&CreateMemoryInput {
                content: "tokio spawns lightweight async tasks on a runtime".into(),
                tags: vec!["rust".into(), "async".into()],
                domain: Some("programming".into()),
                ..Default::default()
            })
            .unwrap();
        // Unrelated content, no shared tags or domain
        service
            .store(&CreateMemoryInput {
                content: "grocery list: eggs, milk, bread".into(),
                ..Default::default()
            })
            .unwrap();

        let cancel2 = CancellationToken::new();
        ai.embed_and_store(&storage, subject.id, &subject.content, &cancel2)
            .await
            .unwrap();
        ai.embed_and_store(&storage, near.id, &near.content, &cancel2)
            .await
            .unwrap();

        let discovered = discover_relationships(&storage, &graph, &ai, subject.id, &cancel)
            .await
            .unwrap();

        assert!(discovered
            .iter()
            .any(|d| d.relationship.target_memory_id == near.id));
        for d in &discovered {
            assert!(d.relationship.auto_generated);
            assert!(d.score >= DISCOVERY_THRESHOLD);
        }
    }

    #[tokio::test]
    async fn test_discovery_rerun_is_noop() {
        let (storage, graph, ai, service) = fixture();
        let cancel = CancellationToken::new();

        let a = service
            .store(&CreateMemoryInput {
                content: "vector clocks order distributed events".into(),
                tags: vec!["distributed".into()],
                ..Default::default()
            })
            .unwrap();
        let b = service
            .store(&CreateMemoryInput {
                content: "vector clocks order distributed events cleanly".into(),
                tags: vec!["distributed".into()],
                ..Default::default()
            })
            .unwrap();
        ai.embed_and_store(&storage, a.id, &a.content, &cancel)
            .await
            .unwrap();
        ai.embed_and_store(&storage, b.id, &b.content, &cancel)
            .await
            .unwrap();

        let first = discover_relationships(&storage, &graph, &ai, a.id, &cancel)
            .await
            .unwrap();
        let second = discover_relationships(&storage, &graph, &ai, a.id, &cancel)
            .await
            .unwrap();
        assert!(!first.is_empty());
        assert!(second.is_empty(), "existing edges are not recreated");
    }
}
