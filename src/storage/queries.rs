//! Database queries for memory operations

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{MycelicError, Result};
use crate::types::*;

/// Canonical column list for memory SELECTs
pub const MEMORY_COLUMNS: &str = "m.id, m.content, m.source, m.importance, m.tags, m.session_id, \
     m.domain, m.agent_type, m.access_scope, m.slug, m.parent_memory_id, \
     m.chunk_level, m.chunk_index, m.source_id, m.external_id, \
     m.embedding IS NOT NULL AS has_embedding, m.access_count, m.last_accessed, \
     m.created_at, m.updated_at";

/// Current timestamp in the canonical on-disk format
pub fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_stamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Parse a memory from a database row using the canonical column list
pub fn memory_from_row(row: &Row) -> rusqlite::Result<Memory> {
    let tags_json: String = row.get("tags")?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();

    let agent_type_str: String = row.get("agent_type")?;
    let access_scope_str: String = row.get("access_scope")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let last_accessed: Option<String> = row.get("last_accessed").unwrap_or(None);
    let has_embedding: i64 = row.get("has_embedding")?;

    Ok(Memory {
        id: row.get("id")?,
        content: row.get("content")?,
        source: row.get("source")?,
        importance: row.get("importance")?,
        tags,
        session_id: row.get("session_id")?,
        domain: row.get("domain")?,
        agent_type: agent_type_str.parse().unwrap_or_default(),
        access_scope: access_scope_str.parse().unwrap_or_default(),
        slug: row.get("slug")?,
        parent_memory_id: row.get("parent_memory_id")?,
        chunk_level: row.get("chunk_level")?,
        chunk_index: row.get("chunk_index")?,
        source_id: row.get("source_id").unwrap_or(None),
        external_id: row.get("external_id").unwrap_or(None),
        has_embedding: has_embedding != 0,
        access_count: row.get("access_count").unwrap_or(0),
        last_accessed: last_accessed.map(|s| parse_stamp(&s)),
        created_at: parse_stamp(&created_at),
        updated_at: parse_stamp(&updated_at),
    })
}

/// Append filter clauses shared by list and search queries
pub fn apply_filters(
    sql: &mut String,
    params: &mut Vec<Box<dyn rusqlite::ToSql>>,
    filters: &SearchFilters,
) {
    if let Some(ref session_id) = filters.session_id {
        sql.push_str(" AND m.session_id = ?");
        params.push(Box::new(session_id.clone()));
    }
    if let Some(ref domain) = filters.domain {
        sql.push_str(" AND m.domain = ?");
        params.push(Box::new(domain.clone()));
    }
    if let Some(min_importance) = filters.min_importance {
        sql.push_str(" AND m.importance >= ?");
        params.push(Box::new(min_importance));
    }
    if let Some(after) = filters.created_after {
        sql.push_str(" AND m.created_at >= ?");
        params.push(Box::new(
            after.to_rfc3339_opts(SecondsFormat::Micros, true),
        ));
    }
    if let Some(before) = filters.created_before {
        sql.push_str(" AND m.created_at <= ?");
        params.push(Box::new(
            before.to_rfc3339_opts(SecondsFormat::Micros, true),
        ));
    }
    if let Some(ref tags) = filters.tags {
        for tag in tags {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM json_each(m.tags) je WHERE je.value = ?)",
            );
            params.push(Box::new(tag.clone()));
        }
    }
}

/// A validated memory ready for insertion. Produced by the memory service;
/// the storage layer assumes fields have already passed validation.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub content: String,
    pub source: Option<String>,
    pub importance: i32,
    pub tags: Vec<String>,
    pub session_id: Option<String>,
    pub domain: Option<String>,
    pub agent_type: AgentType,
    pub access_scope: AccessScope,
    pub slug: Option<String>,
    pub parent_memory_id: Option<MemoryId>,
    pub chunk_level: i32,
    pub chunk_index: Option<i32>,
    pub source_id: Option<i64>,
    pub external_id: Option<String>,
}

/// Insert a memory row; FTS is maintained by trigger
pub fn insert_memory(conn: &Connection, new: &NewMemory) -> Result<MemoryId> {
    let now = now_stamp();
    let tags_json = serde_json::to_string(&new.tags)?;

    conn.execute(
        "INSERT INTO memories (content, source, importance, tags, session_id, domain,
                               agent_type, access_scope, slug, parent_memory_id,
                               chunk_level, chunk_index, source_id, external_id,
                               created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
        params![
            new.content,
            new.source,
            new.importance,
            tags_json,
            new.session_id,
            new.domain,
            new.agent_type.as_str(),
            new.access_scope.as_str(),
            new.slug,
            new.parent_memory_id,
            new.chunk_level,
            new.chunk_index,
            new.source_id,
            new.external_id,
            now,
        ],
    )
    .map_err(|e| match &e {
        rusqlite::Error::SqliteFailure(err, Some(msg))
            if err.code == rusqlite::ErrorCode::ConstraintViolation
                && msg.contains("slug") =>
        {
            MycelicError::AlreadyExists(format!(
                "slug already in use: {}",
                new.slug.as_deref().unwrap_or("")
            ))
        }
        _ => e.into(),
    })?;

    Ok(conn.last_insert_rowid())
}

/// Fetch a memory by id; absence is `Ok(None)`, not an error
pub fn get_memory(conn: &Connection, id: MemoryId) -> Result<Option<Memory>> {
    let sql = format!("SELECT {} FROM memories m WHERE m.id = ?1", MEMORY_COLUMNS);
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.query_row([id], memory_from_row).optional()?)
}

/// Fetch a memory by slug
pub fn get_memory_by_slug(conn: &Connection, slug: &str) -> Result<Option<Memory>> {
    let sql = format!("SELECT {} FROM memories m WHERE m.slug = ?1", MEMORY_COLUMNS);
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.query_row([slug], memory_from_row).optional()?)
}

/// Bump access tracking for a memory
pub fn touch_memory(conn: &Connection, id: MemoryId) -> Result<()> {
    conn.execute(
        "UPDATE memories SET access_count = access_count + 1, last_accessed = ?1 WHERE id = ?2",
        params![now_stamp(), id],
    )?;
    Ok(())
}

/// Fields to change on update; `None` leaves the column untouched
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    pub content: Option<String>,
    pub source: Option<String>,
    pub importance: Option<i32>,
    pub tags: Option<Vec<String>>,
    pub domain: Option<String>,
    pub access_scope: Option<AccessScope>,
    pub slug: Option<String>,
}

impl MemoryPatch {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.source.is_none()
            && self.importance.is_none()
            && self.tags.is_none()
            && self.domain.is_none()
            && self.access_scope.is_none()
            && self.slug.is_none()
    }
}

/// Partial update; only supplied fields change and `updated_at` advances
pub fn update_memory(conn: &Connection, id: MemoryId, patch: &MemoryPatch) -> Result<Memory> {
    let mut sets: Vec<String> = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref content) = patch.content {
        sets.push("content = ?".into());
        params.push(Box::new(content.clone()));
    }
    if let Some(ref source) = patch.source {
        sets.push("source = ?".into());
        params.push(Box::new(source.clone()));
    }
    if let Some(importance) = patch.importance {
        sets.push("importance = ?".into());
        params.push(Box::new(importance));
    }
    if let Some(ref tags) = patch.tags {
        sets.push("tags = ?".into());
        params.push(Box::new(serde_json::to_string(tags)?));
    }
    if let Some(ref domain) = patch.domain {
        sets.push("domain = ?".into());
        params.push(Box::new(domain.clone()));
    }
    if let Some(scope) = patch.access_scope {
        sets.push("access_scope = ?".into());
        params.push(Box::new(scope.as_str()));
    }
    if let Some(ref slug) = patch.slug {
        sets.push("slug = ?".into());
        params.push(Box::new(slug.clone()));
    }

    sets.push("updated_at = ?".into());
    params.push(Box::new(now_stamp()));
    params.push(Box::new(id));

    let sql = format!(
        "UPDATE memories SET {} WHERE id = ?",
        sets.join(", ")
    );
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
    let changed = conn.execute(&sql, param_refs.as_slice())?;
    if changed == 0 {
        return Err(MycelicError::memory_not_found(id));
    }

    get_memory(conn, id)?.ok_or_else(|| MycelicError::memory_not_found(id))
}

/// Delete a memory; relationships, categorizations, vector metadata, and
/// chunks cascade via foreign keys
pub fn delete_memory(conn: &Connection, id: MemoryId) -> Result<()> {
    let changed = conn.execute("DELETE FROM memories WHERE id = ?1", [id])?;
    if changed == 0 {
        return Err(MycelicError::memory_not_found(id));
    }
    Ok(())
}

/// List memories with filters, newest first
pub fn list_memories(conn: &Connection, options: &ListOptions) -> Result<Vec<Memory>> {
    let mut sql = format!("SELECT {} FROM memories m WHERE 1=1", MEMORY_COLUMNS);
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    apply_filters(&mut sql, &mut params, &options.filters);

    sql.push_str(" ORDER BY m.created_at DESC, m.id DESC LIMIT ? OFFSET ?");
    params.push(Box::new(options.limit.unwrap_or(50)));
    params.push(Box::new(options.offset.unwrap_or(0)));

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
    let memories = stmt
        .query_map(param_refs.as_slice(), memory_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(memories)
}

/// Count memories matching the filters
pub fn count_memories(conn: &Connection, filters: &SearchFilters) -> Result<i64> {
    let mut sql = String::from("SELECT COUNT(*) FROM memories m WHERE 1=1");
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    apply_filters(&mut sql, &mut params, filters);

    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
    let count: i64 = conn.query_row(&sql, param_refs.as_slice(), |r| r.get(0))?;
    Ok(count)
}

/// Children of a chunked memory, ordered by chunk index
pub fn get_children(conn: &Connection, parent_id: MemoryId) -> Result<Vec<Memory>> {
    let sql = format!(
        "SELECT {} FROM memories m WHERE m.parent_memory_id = ?1
         ORDER BY m.chunk_level ASC, m.chunk_index ASC",
        MEMORY_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let memories = stmt
        .query_map([parent_id], memory_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(memories)
}

/// Look up an ingested memory by its external reference
pub fn find_by_external_id(
    conn: &Connection,
    source_id: i64,
    external_id: &str,
) -> Result<Option<Memory>> {
    let sql = format!(
        "SELECT {} FROM memories m WHERE m.source_id = ?1 AND m.external_id = ?2",
        MEMORY_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt
        .query_row(params![source_id, external_id], memory_from_row)
        .optional()?)
}

/// All memories ingested from a data source
pub fn get_memories_by_source(conn: &Connection, source_id: i64) -> Result<Vec<Memory>> {
    let sql = format!(
        "SELECT {} FROM memories m WHERE m.source_id = ?1 ORDER BY m.created_at DESC",
        MEMORY_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let memories = stmt
        .query_map([source_id], memory_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(memories)
}

/// Batch-fetch memories by id, preserving the requested order
pub fn get_memories_by_ids(conn: &Connection, ids: &[MemoryId]) -> Result<Vec<Memory>> {
    if ids.is_empty() {
        return Ok(vec![]);
    }
    let placeholders: Vec<&str> = ids.iter().map(|_| "?").collect();
    let sql = format!(
        "SELECT {} FROM memories m WHERE m.id IN ({})",
        MEMORY_COLUMNS,
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
    let mut fetched = stmt
        .query_map(params.as_slice(), memory_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    // Restore request order
    fetched.sort_by_key(|m| ids.iter().position(|&id| id == m.id).unwrap_or(usize::MAX));
    Ok(fetched)
}

/// Store an embedding blob and its vector metadata
pub fn store_embedding(
    conn: &Connection,
    id: MemoryId,
    embedding: &[f32],
    model: &str,
    vector_index: &str,
) -> Result<()> {
    let blob = embedding_to_blob(embedding);
    let changed = conn.execute(
        "UPDATE memories SET embedding = ?1 WHERE id = ?2",
        params![blob, id],
    )?;
    if changed == 0 {
        return Err(MycelicError::memory_not_found(id));
    }
    conn.execute(
        "INSERT INTO vector_metadata (memory_id, vector_index, embedding_model, dimension, last_updated)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(memory_id) DO UPDATE SET
             vector_index = excluded.vector_index,
             embedding_model = excluded.embedding_model,
             dimension = excluded.dimension,
             last_updated = excluded.last_updated",
        params![id, vector_index, model, embedding.len() as i64, now_stamp()],
    )?;
    Ok(())
}

/// Fetch a stored embedding
pub fn get_embedding(conn: &Connection, id: MemoryId) -> Result<Option<Vec<f32>>> {
    let blob: Option<Vec<u8>> = conn
        .query_row("SELECT embedding FROM memories WHERE id = ?1", [id], |r| {
            r.get(0)
        })
        .optional()?
        .flatten();
    Ok(blob.map(|b| embedding_from_blob(&b)))
}

/// Encode an embedding as little-endian f32 bytes
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

/// Decode little-endian f32 bytes back into an embedding
pub fn embedding_from_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Aggregate statistics about the store
pub fn storage_stats(conn: &Connection) -> Result<StorageStats> {
    let mut stats = StorageStats {
        total_memories: conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?,
        total_relationships: conn.query_row(
            "SELECT COUNT(*) FROM memory_relationships",
            [],
            |r| r.get(0),
        )?,
        total_categories: conn.query_row("SELECT COUNT(*) FROM categories", [], |r| r.get(0))?,
        total_domains: conn.query_row("SELECT COUNT(*) FROM domains", [], |r| r.get(0))?,
        total_sessions: conn.query_row("SELECT COUNT(*) FROM agent_sessions", [], |r| r.get(0))?,
        memories_with_embeddings: conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE embedding IS NOT NULL",
            [],
            |r| r.get(0),
        )?,
        db_size_bytes: conn.query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |r| r.get(0),
        )?,
        schema_version: conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |r| r.get(0),
        )?,
        ..Default::default()
    };

    let mut stmt = conn.prepare(
        "SELECT domain, COUNT(*) FROM memories WHERE domain IS NOT NULL GROUP BY domain",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (domain, count) = row?;
        stats.domain_counts.insert(domain, count);
    }

    Ok(stats)
}
