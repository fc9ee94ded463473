//! Graph subsystem: typed relationship management and bounded traversal

pub mod discovery;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{MycelicError, Result};
use crate::memory::validate;
use crate::storage::{graph_queries, Storage};
use crate::types::*;

/// Upper bound on one traversal query
pub const TRAVERSAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Relationship CRUD and traversal over the storage engine
#[derive(Clone)]
pub struct GraphService {
    storage: Storage,
}

impl GraphService {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Create a typed edge; strength is validated into [0, 1]
    pub fn relate(&self, input: &CreateRelationshipInput) -> Result<Relationship> {
        if let Some(strength) = input.strength {
            validate::validate_strength(strength)?;
        }
        if input.source_memory_id == input.target_memory_id {
            return Err(MycelicError::invalid(
                "target_memory_id",
                "cannot relate a memory to itself",
            ));
        }
        self.storage
            .with_writer(|conn| graph_queries::create_relationship(conn, input))
    }

    pub fn unrelate(&self, relationship_id: i64) -> Result<()> {
        self.storage
            .with_writer(|conn| graph_queries::delete_relationship(conn, relationship_id))
    }

    /// Direct edges touching a memory
    pub fn find_related(&self, memory_id: MemoryId) -> Result<Vec<Relationship>> {
        self.storage
            .with_reader(|conn| graph_queries::find_related(conn, memory_id))
    }

    /// Bounded traversal from a root memory.
    ///
    /// Runs the recursive query on a blocking thread; a watchdog interrupts
    /// the connection if the query outlives the timeout or the caller
    /// cancels, surfacing `Timeout`/`Cancelled` instead of hanging.
    pub async fn map_graph(
        &self,
        root_id: MemoryId,
        max_depth: i32,
        cancel: &CancellationToken,
    ) -> Result<MemoryGraph> {
        let handle = self.storage.reader();
        let interrupt = handle.interrupt.clone();
        let conn = handle.conn;

        let query = tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            graph_queries::traverse_graph(&conn, root_id, max_depth)
        });

        tokio::select! {
            result = query => {
                result.map_err(|e| {
                    MycelicError::Internal(format!("traversal task failed: {}", e))
                })?
            }
            _ = tokio::time::sleep(TRAVERSAL_TIMEOUT) => {
                interrupt.interrupt();
                Err(MycelicError::Timeout(format!(
                    "graph traversal from {} exceeded {:?}",
                    root_id, TRAVERSAL_TIMEOUT
                )))
            }
            _ = cancel.cancelled() => {
                interrupt.interrupt();
                Err(MycelicError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queries::{insert_memory, NewMemory};

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

    #[tokio::test]
    async fn test_relate_and_map() {
        let storage = Storage::open_in_memory().unwrap();
        let graph = GraphService::new(storage.clone());

        let (a, b) = storage
            .with_transaction(|conn| {
                Ok((
                    insert_memory(conn, &mem("a"))?,
                    insert_memory(conn, &mem("b"))?,
                ))
            })
            .unwrap();

        graph
            .relate(&CreateRelationshipInput {
                source_memory_id: a,
                target_memory_id: b,
                relationship_type: RelationshipType::Expands,
                strength: Some(0.8),
                context: Some("b elaborates a".into()),
                auto_generated: false,
            })
            .unwrap();

        let result = graph
            .map_graph(a, 5, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.nodes.len(), 2);
        assert_eq!(result.edges.len(), 1);
        assert_eq!(result.edges[0].relationship_type, RelationshipType::Expands);
    }

    #[tokio::test]
    async fn test_invalid_strength_rejected() {
        let storage = Storage::open_in_memory().unwrap();
        let graph = GraphService::new(storage);
        let err = graph.relate(&CreateRelationshipInput {
            source_memory_id: 1,
            target_memory_id: 2,
            relationship_type: RelationshipType::Similar,
            strength: Some(1.5),
            context: None,
            auto_generated: false,
        });
        assert!(matches!(err, Err(MycelicError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_self_edge_rejected() {
        let storage = Storage::open_in_memory().unwrap();
        let graph = GraphService::new(storage.clone());
        let id = storage
            .with_writer(|conn| insert_memory(conn, &mem("solo")))
            .unwrap();
        let err = graph.relate(&CreateRelationshipInput {
            source_memory_id: id,
            target_memory_id: id,
            relationship_type: RelationshipType::Similar,
            strength: None,
            context: None,
            auto_generated: false,
        });
        assert!(matches!(err, Err(MycelicError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_traversal() {
        let storage = Storage::open_in_memory().unwrap();
        let graph = GraphService::new(storage.clone());
        let id = storage
            .with_writer(|conn| insert_memory(conn, &mem("root")))
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        // An already-cancelled token may still lose the race to a fast
        // query; accept either a result or Cancelled, never a hang.
        let outcome = graph.map_graph(id, 3, &cancel).await;
        match outcome {
            Ok(_) | Err(MycelicError::Cancelled) => {}
            other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
        }
    }
}
