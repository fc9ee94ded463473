//! Relationship queries and bounded graph traversal
//!
//! Traversal is a single recursive query over `memory_relationships`,
//! treating edges as undirected for reachability while the returned edges
//! preserve direction. Cycle avoidance uses a path string carried through
//! the recursion; depth is bounded; nodes deduplicate to MIN(distance).
//! Regardless of graph size the traversal costs two database round-trips:
//! one for nodes, one for the edges among them.

use rusqlite::{params, Connection, OptionalExtension};

use super::queries::now_stamp;
use crate::error::{MycelicError, Result};
use crate::types::*;

/// Depth bounds for traversal
pub const MIN_DEPTH: i32 = 1;
pub const MAX_DEPTH: i32 = 10;

fn relationship_from_row(row: &rusqlite::Row) -> rusqlite::Result<Relationship> {
    let type_str: String = row.get("relationship_type")?;
    let created_at: String = row.get("created_at")?;
    let auto_generated: i64 = row.get("auto_generated")?;
    Ok(Relationship {
        id: row.get("id")?,
        source_memory_id: row.get("source_memory_id")?,
        target_memory_id: row.get("target_memory_id")?,
        relationship_type: type_str.parse().unwrap_or_default(),
        strength: row.get("strength")?,
        context: row.get("context")?,
        auto_generated: auto_generated != 0,
        created_at: super::queries::parse_stamp(&created_at),
    })
}

/// Create a relationship between two existing memories
pub fn create_relationship(
    conn: &Connection,
    input: &CreateRelationshipInput,
) -> Result<Relationship> {
    for id in [input.source_memory_id, input.target_memory_id] {
        let exists: i64 =
            conn.query_row("SELECT COUNT(*) FROM memories WHERE id = ?1", [id], |r| {
                r.get(0)
            })?;
        if exists == 0 {
            return Err(MycelicError::memory_not_found(id));
        }
    }

    let strength = input.strength.unwrap_or(0.5);
    conn.execute(
        "INSERT INTO memory_relationships
             (source_memory_id, target_memory_id, relationship_type, strength,
              context, auto_generated, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            input.source_memory_id,
            input.target_memory_id,
            input.relationship_type.as_str(),
            strength,
            input.context,
            input.auto_generated,
            now_stamp(),
        ],
    )
    .map_err(|e| match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            MycelicError::AlreadyExists(format!(
                "relationship {} -> {} ({}) already exists",
                input.source_memory_id,
                input.target_memory_id,
                input.relationship_type.as_str()
            ))
        }
        _ => e.into(),
    })?;

    let id = conn.last_insert_rowid();
    get_relationship(conn, id)?.ok_or_else(|| MycelicError::not_found("relationship", id))
}

/// Fetch a relationship by id
pub fn get_relationship(conn: &Connection, id: i64) -> Result<Option<Relationship>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, source_memory_id, target_memory_id, relationship_type,
                strength, context, auto_generated, created_at
         FROM memory_relationships WHERE id = ?1",
    )?;
    Ok(stmt.query_row([id], relationship_from_row).optional()?)
}

/// Delete a relationship by id
pub fn delete_relationship(conn: &Connection, id: i64) -> Result<()> {
    let changed = conn.execute("DELETE FROM memory_relationships WHERE id = ?1", [id])?;
    if changed == 0 {
        return Err(MycelicError::not_found("relationship", id));
    }
    Ok(())
}

/// All relationships touching a memory, in either direction
pub fn find_related(conn: &Connection, memory_id: MemoryId) -> Result<Vec<Relationship>> {
    let exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE id = ?1",
        [memory_id],
        |r| r.get(0),
    )?;
    if exists == 0 {
        return Err(MycelicError::memory_not_found(memory_id));
    }

    let mut stmt = conn.prepare_cached(
        "SELECT id, source_memory_id, target_memory_id, relationship_type,
                strength, context, auto_generated, created_at
         FROM memory_relationships
         WHERE source_memory_id = ?1 OR target_memory_id = ?1
         ORDER BY strength DESC, id ASC",
    )?;
    let relationships = stmt
        .query_map([memory_id], relationship_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(relationships)
}

/// List relationships between members of a memory set
pub fn relationships_among(
    conn: &Connection,
    memory_ids: &[MemoryId],
) -> Result<Vec<Relationship>> {
    if memory_ids.is_empty() {
        return Ok(vec![]);
    }
    let placeholders: Vec<&str> = memory_ids.iter().map(|_| "?").collect();
    let list = placeholders.join(", ");
    let sql = format!(
        "SELECT id, source_memory_id, target_memory_id, relationship_type,
                strength, context, auto_generated, created_at
         FROM memory_relationships
         WHERE source_memory_id IN ({list}) AND target_memory_id IN ({list})
         ORDER BY id ASC",
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut param_values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(memory_ids.len() * 2);
    for id in memory_ids {
        param_values.push(id);
    }
    for id in memory_ids {
        param_values.push(id);
    }
    let relationships = stmt
        .query_map(param_values.as_slice(), relationship_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(relationships)
}

/// Traverse the relationship graph out to `max_depth` hops from `root_id`.
///
/// Returns the reachable nodes ordered by distance ascending, importance
/// descending, then id, followed by every edge whose endpoints are both in
/// the discovered set. Unknown roots surface as `NotFound`.
pub fn traverse_graph(
    conn: &Connection,
    root_id: MemoryId,
    max_depth: i32,
) -> Result<MemoryGraph> {
    let max_depth = max_depth.clamp(MIN_DEPTH, MAX_DEPTH);

    let root_exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE id = ?1",
        [root_id],
        |r| r.get(0),
    )?;
    if root_exists == 0 {
        return Err(MycelicError::memory_not_found(root_id));
    }

    let mut stmt = conn.prepare_cached(
        r#"
        WITH RECURSIVE walk(id, distance, path) AS (
            SELECT m.id, 0, ',' || m.id || ','
            FROM memories m
            WHERE m.id = ?1

            UNION ALL

            SELECT
                CASE WHEN r.source_memory_id = w.id
                     THEN r.target_memory_id
                     ELSE r.source_memory_id END,
                w.distance + 1,
                w.path ||
                    CASE WHEN r.source_memory_id = w.id
                         THEN r.target_memory_id
                         ELSE r.source_memory_id END || ','
            FROM walk w
            JOIN memory_relationships r
              ON r.source_memory_id = w.id OR r.target_memory_id = w.id
            WHERE w.distance < ?2
              AND instr(
                    w.path,
                    ',' || CASE WHEN r.source_memory_id = w.id
                                THEN r.target_memory_id
                                ELSE r.source_memory_id END || ','
                  ) = 0
        )
        SELECT m.id,
               substr(m.content, 1, 200) AS content_preview,
               m.importance,
               m.domain,
               m.tags,
               m.session_id,
               MIN(w.distance) AS distance
        FROM walk w
        JOIN memories m ON m.id = w.id
        GROUP BY m.id
        ORDER BY distance ASC, m.importance DESC, m.id ASC
        "#,
    )?;

    let nodes = stmt
        .query_map(params![root_id, max_depth], |row| {
            let tags_json: String = row.get("tags")?;
            Ok(GraphNode {
                id: row.get("id")?,
                content_preview: row.get("content_preview")?,
                importance: row.get("importance")?,
                domain: row.get("domain")?,
                tags: serde_json::from_str(&tags_json).unwrap_or_default(),
                session_id: row.get("session_id")?,
                distance: row.get("distance")?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let node_ids: Vec<MemoryId> = nodes.iter().map(|n| n.id).collect();
    let mut edges: Vec<GraphEdge> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for rel in relationships_among(conn, &node_ids)? {
        // De-duplicate parallel edges by (source, target), first wins
        if seen.insert((rel.source_memory_id, rel.target_memory_id)) {
            edges.push(GraphEdge {
                source_memory_id: rel.source_memory_id,
                target_memory_id: rel.target_memory_id,
                relationship_type: rel.relationship_type,
                strength: rel.strength,
            });
        }
    }

    Ok(MemoryGraph {
        root_id,
        max_depth,
        nodes,
        edges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queries::{insert_memory, NewMemory};
    use crate::storage::Storage;

    fn mem(content: &str, importance: i32) -> NewMemory {
        NewMemory {
            content: content.to_string(),
            source: None,
            importance,
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

    fn link(
        conn: &Connection,
        from: MemoryId,
        to: MemoryId,
        rt: RelationshipType,
        strength: f64,
    ) -> Relationship {
        create_relationship(
            conn,
            &CreateRelationshipInput {
                source_memory_id: from,
                target_memory_id: to,
                relationship_type: rt,
                strength: Some(strength),
                context: None,
                auto_generated: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_create_requires_existing_endpoints() {
        let storage = Storage::open_in_memory().unwrap();
        let err = storage.with_writer(|conn| {
            create_relationship(
                conn,
                &CreateRelationshipInput {
                    source_memory_id: 1,
                    target_memory_id: 2,
                    relationship_type: RelationshipType::Similar,
                    strength: None,
                    context: None,
                    auto_generated: false,
                },
            )
        });
        assert!(matches!(err, Err(MycelicError::NotFound { .. })));
    }

    #[test]
    fn test_cycle_terminates() {
        let storage = Storage::open_in_memory().unwrap();
        let (x, y, z) = storage
            .with_transaction(|conn| {
                let x = insert_memory(conn, &mem("X", 5))?;
                let y = insert_memory(conn, &mem("Y", 5))?;
                let z = insert_memory(conn, &mem("Z", 5))?;
                link(conn, x, y, RelationshipType::Expands, 0.8);
                link(conn, y, z, RelationshipType::Sequential, 0.9);
                link(conn, z, x, RelationshipType::References, 0.5);
                Ok((x, y, z))
            })
            .unwrap();

        let graph = storage
            .with_reader(|conn| traverse_graph(conn, x, 10))
            .unwrap();
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges.len(), 3);

        let dist = |id| graph.nodes.iter().find(|n| n.id == id).unwrap().distance;
        assert_eq!(dist(x), 0);
        assert_eq!(dist(y), 1);
        assert_eq!(dist(z), 1);
    }

    #[test]
    fn test_depth_monotonicity() {
        let storage = Storage::open_in_memory().unwrap();
        // Chain a -> b -> c -> d
        let ids = storage
            .with_transaction(|conn| {
                let a = insert_memory(conn, &mem("a", 5))?;
                let b = insert_memory(conn, &mem("b", 5))?;
                let c = insert_memory(conn, &mem("c", 5))?;
                let d = insert_memory(conn, &mem("d", 5))?;
                link(conn, a, b, RelationshipType::Sequential, 0.9);
                link(conn, b, c, RelationshipType::Sequential, 0.9);
                link(conn, c, d, RelationshipType::Sequential, 0.9);
                Ok((a, b, c, d))
            })
            .unwrap();

        let shallow = storage
            .with_reader(|conn| traverse_graph(conn, ids.0, 1))
            .unwrap();
        let deep = storage
            .with_reader(|conn| traverse_graph(conn, ids.0, 3))
            .unwrap();

        assert_eq!(shallow.nodes.len(), 2);
        assert_eq!(deep.nodes.len(), 4);
        let shallow_ids: Vec<_> = shallow.nodes.iter().map(|n| n.id).collect();
        for id in &shallow_ids {
            assert!(deep.nodes.iter().any(|n| n.id == *id));
        }
    }

    #[test]
    fn test_undirected_reachability_directed_edges() {
        let storage = Storage::open_in_memory().unwrap();
        let (a, b) = storage
            .with_transaction(|conn| {
                let a = insert_memory(conn, &mem("a", 5))?;
                let b = insert_memory(conn, &mem("b", 5))?;
                // Edge points b -> a; traversal from a must still reach b
                link(conn, b, a, RelationshipType::References, 0.7);
                Ok((a, b))
            })
            .unwrap();

        let graph = storage
            .with_reader(|conn| traverse_graph(conn, a, 2))
            .unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert!(graph.nodes.iter().any(|n| n.id == b));
        // Direction preserved on the returned edge
        assert_eq!(graph.edges[0].source_memory_id, b);
        assert_eq!(graph.edges[0].target_memory_id, a);
    }

    #[test]
    fn test_equal_distance_ordered_by_importance_then_id() {
        let storage = Storage::open_in_memory().unwrap();
        let (root, low, high) = storage
            .with_transaction(|conn| {
                let root = insert_memory(conn, &mem("root", 5))?;
                let low = insert_memory(conn, &mem("low", 2))?;
                let high = insert_memory(conn, &mem("high", 9))?;
                link(conn, root, low, RelationshipType::References, 0.5);
                link(conn, root, high, RelationshipType::References, 0.5);
                Ok((root, low, high))
            })
            .unwrap();

        let graph = storage
            .with_reader(|conn| traverse_graph(conn, root, 1))
            .unwrap();
        let order: Vec<_> = graph.nodes.iter().map(|n| n.id).collect();
        assert_eq!(order, vec![root, high, low]);
    }

    #[test]
    fn test_unknown_root_is_not_found() {
        let storage = Storage::open_in_memory().unwrap();
        let err = storage.with_reader(|conn| traverse_graph(conn, 999, 3));
        assert!(matches!(err, Err(MycelicError::NotFound { .. })));
    }

    #[test]
    fn test_depth_clamped_into_bounds() {
        let storage = Storage::open_in_memory().unwrap();
        let root = storage
            .with_writer(|conn| insert_memory(conn, &mem("solo", 5)))
            .unwrap();
        let graph = storage
            .with_reader(|conn| traverse_graph(conn, root, 99))
            .unwrap();
        assert_eq!(graph.max_depth, MAX_DEPTH);

        let graph = storage
            .with_reader(|conn| traverse_graph(conn, root, 0))
            .unwrap();
        assert_eq!(graph.max_depth, MIN_DEPTH);
    }

    #[test]
    fn test_delete_memory_cascades_edges() {
        let storage = Storage::open_in_memory().unwrap();
        let (a, b) = storage
            .with_transaction(|conn| {
                let a = insert_memory(conn, &mem("a", 5))?;
                let b = insert_memory(conn, &mem("b", 5))?;
                link(conn, a, b, RelationshipType::Similar, 0.7);
                Ok((a, b))
            })
            .unwrap();

        storage
            .with_writer(|conn| crate::storage::queries::delete_memory(conn, a))
            .unwrap();
        let remaining = storage.with_reader(|conn| find_related(conn, b)).unwrap();
        assert!(remaining.is_empty());
    }
}
