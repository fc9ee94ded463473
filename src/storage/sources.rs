//! Data source registry, sync history, and ingest deduplication

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;

use super::queries::{self, now_stamp, parse_stamp, NewMemory};
use crate::error::{MycelicError, Result};
use crate::types::*;

fn source_from_row(row: &rusqlite::Row) -> rusqlite::Result<DataSource> {
    let config_json: String = row.get("config")?;
    let status_str: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let last_sync_at: Option<String> = row.get("last_sync_at")?;
    let config: HashMap<String, serde_json::Value> =
        serde_json::from_str(&config_json).unwrap_or_default();

    Ok(DataSource {
        id: row.get("id")?,
        source_type: row.get("source_type")?,
        name: row.get("name")?,
        config,
        status: status_str.parse().unwrap_or_default(),
        last_sync_at: last_sync_at.map(|s| parse_stamp(&s)),
        last_sync_position: row.get("last_sync_position")?,
        error_message: row.get("error_message")?,
        created_at: parse_stamp(&created_at),
    })
}

/// Register a data source
pub fn create_source(
    conn: &Connection,
    source_type: &str,
    name: &str,
    config: &HashMap<String, serde_json::Value>,
) -> Result<DataSource> {
    if name.trim().is_empty() {
        return Err(MycelicError::invalid("name", "must not be empty"));
    }
    conn.execute(
        "INSERT INTO data_sources (source_type, name, config, status, created_at)
         VALUES (?1, ?2, ?3, 'active', ?4)",
        params![
            source_type,
            name,
            serde_json::to_string(config)?,
            now_stamp()
        ],
    )
    .map_err(|e| match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            MycelicError::AlreadyExists(format!("data source already exists: {}", name))
        }
        _ => e.into(),
    })?;

    let id = conn.last_insert_rowid();
    get_source(conn, id)?.ok_or_else(|| MycelicError::not_found("data source", id))
}

pub fn get_source(conn: &Connection, id: i64) -> Result<Option<DataSource>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, source_type, name, config, status, last_sync_at,
                last_sync_position, error_message, created_at
         FROM data_sources WHERE id = ?1",
    )?;
    Ok(stmt.query_row([id], source_from_row).optional()?)
}

pub fn list_sources(conn: &Connection) -> Result<Vec<DataSource>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, source_type, name, config, status, last_sync_at,
                last_sync_position, error_message, created_at
         FROM data_sources ORDER BY name ASC",
    )?;
    let sources = stmt
        .query_map([], source_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(sources)
}

pub fn delete_source(conn: &Connection, id: i64) -> Result<()> {
    let changed = conn.execute("DELETE FROM data_sources WHERE id = ?1", [id])?;
    if changed == 0 {
        return Err(MycelicError::not_found("data source", id));
    }
    Ok(())
}

/// Update source status, clearing any error message on recovery
pub fn set_source_status(
    conn: &Connection,
    id: i64,
    status: SourceStatus,
    error_message: Option<&str>,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE data_sources SET status = ?1, error_message = ?2 WHERE id = ?3",
        params![status.as_str(), error_message, id],
    )?;
    if changed == 0 {
        return Err(MycelicError::not_found("data source", id));
    }
    Ok(())
}

/// Record a successful sync's end position
pub fn set_sync_position(conn: &Connection, id: i64, position: Option<&str>) -> Result<()> {
    let changed = conn.execute(
        "UPDATE data_sources SET last_sync_at = ?1, last_sync_position = ?2 WHERE id = ?3",
        params![now_stamp(), position, id],
    )?;
    if changed == 0 {
        return Err(MycelicError::not_found("data source", id));
    }
    Ok(())
}

/// Ingest one external record, deduplicating on (source_id, external_id).
///
/// A hit returns the existing memory id with `created = false`; a miss
/// inserts and returns `created = true`. The partial unique index enforces
/// at-most-once even under races, so a constraint violation re-reads.
pub fn ingest_memory(conn: &Connection, new: &NewMemory) -> Result<IngestOutcome> {
    let (source_id, external_id) = match (new.source_id, new.external_id.as_deref()) {
        (Some(s), Some(e)) => (s, e),
        _ => {
            return Err(MycelicError::invalid(
                "external_id",
                "ingest requires both source_id and external_id",
            ))
        }
    };

    if let Some(existing) = queries::find_by_external_id(conn, source_id, external_id)? {
        return Ok(IngestOutcome {
            memory_id: existing.id,
            created: false,
        });
    }

    match queries::insert_memory(conn, new) {
        Ok(memory_id) => Ok(IngestOutcome {
            memory_id,
            created: true,
        }),
        Err(e) if matches!(&e, MycelicError::Database(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation) =>
        {
            // Lost a race to another writer; the row exists now
            let existing = queries::find_by_external_id(conn, source_id, external_id)?
                .ok_or(e)?;
            Ok(IngestOutcome {
                memory_id: existing.id,
                created: false,
            })
        }
        Err(e) => Err(e),
    }
}

fn history_from_row(row: &rusqlite::Row) -> rusqlite::Result<SyncHistory> {
    let status_str: String = row.get("status")?;
    let started_at: String = row.get("started_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    Ok(SyncHistory {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        started_at: parse_stamp(&started_at),
        completed_at: completed_at.map(|s| parse_stamp(&s)),
        items_processed: row.get("items_processed")?,
        memories_created: row.get("memories_created")?,
        duplicates_skipped: row.get("duplicates_skipped")?,
        status: status_str.parse().unwrap_or(SyncStatus::Failed),
        error_message: row.get("error_message")?,
    })
}

/// Open a sync-history row in the running state
pub fn open_sync_history(conn: &Connection, source_id: i64) -> Result<i64> {
    conn.execute(
        "INSERT INTO data_source_sync_history (source_id, started_at, status)
         VALUES (?1, ?2, 'running')",
        params![source_id, now_stamp()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Close a sync-history row with final counters and status
pub fn close_sync_history(
    conn: &Connection,
    history_id: i64,
    items_processed: i64,
    memories_created: i64,
    duplicates_skipped: i64,
    status: SyncStatus,
    error_message: Option<&str>,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE data_source_sync_history
         SET completed_at = ?1, items_processed = ?2, memories_created = ?3,
             duplicates_skipped = ?4, status = ?5, error_message = ?6
         WHERE id = ?7",
        params![
            now_stamp(),
            items_processed,
            memories_created,
            duplicates_skipped,
            status.as_str(),
            error_message,
            history_id
        ],
    )?;
    if changed == 0 {
        return Err(MycelicError::not_found("sync history", history_id));
    }
    Ok(())
}

/// Sync history for a source, newest first
pub fn list_sync_history(
    conn: &Connection,
    source_id: i64,
    limit: i64,
) -> Result<Vec<SyncHistory>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, source_id, started_at, completed_at, items_processed,
                memories_created, duplicates_skipped, status, error_message
         FROM data_source_sync_history
         WHERE source_id = ?1 ORDER BY started_at DESC LIMIT ?2",
    )?;
    let history = stmt
        .query_map(params![source_id, limit], history_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn external_memory(source_id: i64, external_id: &str, content: &str) -> NewMemory {
        NewMemory {
            content: content.to_string(),
            source: None,
            importance: 5,
            tags: vec![],
            session_id: None,
            domain: None,
            agent_type: AgentType::Api,
            access_scope: AccessScope::Session,
            slug: None,
            parent_memory_id: None,
            chunk_level: 0,
            chunk_index: None,
            source_id: Some(source_id),
            external_id: Some(external_id.to_string()),
        }
    }

    #[test]
    fn test_ingest_dedup() {
        let storage = Storage::open_in_memory().unwrap();
        let source = storage
            .with_writer(|conn| create_source(conn, "test", "s1", &HashMap::new()))
            .unwrap();

        let first = storage
            .with_writer(|conn| ingest_memory(conn, &external_memory(source.id, "ext-1", "hello")))
            .unwrap();
        assert!(first.created);

        let second = storage
            .with_writer(|conn| ingest_memory(conn, &external_memory(source.id, "ext-1", "hello")))
            .unwrap();
        assert!(!second.created);
        assert_eq!(first.memory_id, second.memory_id);

        let memories = storage
            .with_reader(|conn| queries::get_memories_by_source(conn, source.id))
            .unwrap();
        assert_eq!(memories.len(), 1);
    }

    #[test]
    fn test_ingest_requires_external_reference() {
        let storage = Storage::open_in_memory().unwrap();
        let mut incomplete = external_memory(1, "x", "body");
        incomplete.external_id = None;
        let err = storage.with_writer(|conn| ingest_memory(conn, &incomplete));
        assert!(matches!(err, Err(MycelicError::InvalidInput { .. })));
    }

    #[test]
    fn test_sync_history_lifecycle() {
        let storage = Storage::open_in_memory().unwrap();
        let source = storage
            .with_writer(|conn| create_source(conn, "test", "s1", &HashMap::new()))
            .unwrap();

        let history_id = storage
            .with_writer(|conn| open_sync_history(conn, source.id))
            .unwrap();
        storage
            .with_writer(|conn| {
                close_sync_history(conn, history_id, 5, 4, 1, SyncStatus::Completed, None)
            })
            .unwrap();
        storage
            .with_writer(|conn| set_sync_position(conn, source.id, Some("cursor-42")))
            .unwrap();

        let history = storage
            .with_reader(|conn| list_sync_history(conn, source.id, 10))
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, SyncStatus::Completed);
        assert_eq!(history[0].memories_created, 4);
        assert_eq!(history[0].duplicates_skipped, 1);

        let source = storage
            .with_reader(|conn| get_source(conn, source.id))
            .unwrap()
            .unwrap();
        assert_eq!(source.last_sync_position.as_deref(), Some("cursor-42"));
        assert!(source.last_sync_at.is_some());
    }

    #[test]
    fn test_source_status_transitions() {
        let storage = Storage::open_in_memory().unwrap();
        let source = storage
            .with_writer(|conn| create_source(conn, "test", "s1", &HashMap::new()))
            .unwrap();
        storage
            .with_writer(|conn| {
                set_source_status(conn, source.id, SourceStatus::Error, Some("boom"))
            })
            .unwrap();

        let reloaded = storage
            .with_reader(|conn| get_source(conn, source.id))
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, SourceStatus::Error);
        assert_eq!(reloaded.error_message.as_deref(), Some("boom"));
    }
}
