//! Agent session persistence

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;

use super::queries::{now_stamp, parse_stamp};
use crate::error::{MycelicError, Result};
use crate::types::*;

fn session_from_row(row: &rusqlite::Row) -> rusqlite::Result<SessionRecord> {
    let agent_type_str: String = row.get("agent_type")?;
    let created_at: String = row.get("created_at")?;
    let last_accessed: String = row.get("last_accessed")?;
    let active: i64 = row.get("active")?;
    let metadata_json: String = row.get("metadata")?;
    let metadata: HashMap<String, serde_json::Value> =
        serde_json::from_str(&metadata_json).unwrap_or_default();

    Ok(SessionRecord {
        session_id: row.get("session_id")?,
        agent_type: agent_type_str.parse().unwrap_or_default(),
        agent_context: row.get("agent_context")?,
        created_at: parse_stamp(&created_at),
        last_accessed: parse_stamp(&last_accessed),
        active: active != 0,
        metadata,
    })
}

/// Insert or refresh a session record
pub fn upsert_session(
    conn: &Connection,
    session_id: &str,
    agent_type: AgentType,
    agent_context: Option<&str>,
) -> Result<SessionRecord> {
    if session_id.trim().is_empty() {
        return Err(MycelicError::invalid("session_id", "must not be empty"));
    }

    let now = now_stamp();
    conn.execute(
        "INSERT INTO agent_sessions (session_id, agent_type, agent_context,
                                     created_at, last_accessed, active, metadata)
         VALUES (?1, ?2, ?3, ?4, ?4, 1, '{}')
         ON CONFLICT(session_id) DO UPDATE SET
             last_accessed = excluded.last_accessed,
             active = 1,
             agent_context = COALESCE(excluded.agent_context, agent_sessions.agent_context)",
        params![session_id, agent_type.as_str(), agent_context, now],
    )?;

    get_session(conn, session_id)?
        .ok_or_else(|| MycelicError::not_found("session", session_id))
}

pub fn get_session(conn: &Connection, session_id: &str) -> Result<Option<SessionRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT session_id, agent_type, agent_context, created_at, last_accessed,
                active, metadata
         FROM agent_sessions WHERE session_id = ?1",
    )?;
    Ok(stmt.query_row([session_id], session_from_row).optional()?)
}

/// List sessions, most recently used first
pub fn list_sessions(conn: &Connection, limit: i64) -> Result<Vec<SessionRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT session_id, agent_type, agent_context, created_at, last_accessed,
                active, metadata
         FROM agent_sessions ORDER BY last_accessed DESC LIMIT ?1",
    )?;
    let sessions = stmt
        .query_map([limit], session_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(sessions)
}

/// Mark a session inactive
pub fn deactivate_session(conn: &Connection, session_id: &str) -> Result<()> {
    let changed = conn.execute(
        "UPDATE agent_sessions SET active = 0 WHERE session_id = ?1",
        [session_id],
    )?;
    if changed == 0 {
        return Err(MycelicError::not_found("session", session_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[test]
    fn test_upsert_preserves_created_at() {
        let storage = Storage::open_in_memory().unwrap();
        let first = storage
            .with_writer(|conn| upsert_session(conn, "s-1", AgentType::Code, None))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = storage
            .with_writer(|conn| upsert_session(conn, "s-1", AgentType::Code, Some("ctx")))
            .unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert!(second.last_accessed > first.last_accessed);
        assert_eq!(second.agent_context.as_deref(), Some("ctx"));
    }

    #[test]
    fn test_empty_session_id_rejected() {
        let storage = Storage::open_in_memory().unwrap();
        let err = storage.with_writer(|conn| upsert_session(conn, "  ", AgentType::Api, None));
        assert!(matches!(err, Err(MycelicError::InvalidInput { .. })));
    }

    #[test]
    fn test_list_orders_by_recency() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_writer(|conn| upsert_session(conn, "old", AgentType::Desktop, None))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        storage
            .with_writer(|conn| upsert_session(conn, "new", AgentType::Desktop, None))
            .unwrap();

        let sessions = storage.with_reader(|conn| list_sessions(conn, 10)).unwrap();
        assert_eq!(sessions[0].session_id, "new");
        assert_eq!(sessions[1].session_id, "old");
    }
}
