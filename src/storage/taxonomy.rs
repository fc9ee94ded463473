//! Categories, categorizations, and domains

use rusqlite::{params, Connection, OptionalExtension};

use super::queries::{now_stamp, parse_stamp};
use crate::error::{MycelicError, Result};
use crate::types::*;

fn category_from_row(row: &rusqlite::Row) -> rusqlite::Result<Category> {
    let created_at: String = row.get("created_at")?;
    let auto_generated: i64 = row.get("auto_generated")?;
    Ok(Category {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        parent_category_id: row.get("parent_category_id")?,
        confidence_threshold: row.get("confidence_threshold")?,
        auto_generated: auto_generated != 0,
        created_at: parse_stamp(&created_at),
    })
}

/// Create a category; names are unique
pub fn create_category(
    conn: &Connection,
    name: &str,
    description: Option<&str>,
    parent_category_id: Option<i64>,
    confidence_threshold: Option<f64>,
    auto_generated: bool,
) -> Result<Category> {
    let threshold = confidence_threshold.unwrap_or(0.7);
    if !(0.0..=1.0).contains(&threshold) {
        return Err(MycelicError::invalid(
            "confidence_threshold",
            "must be within [0.0, 1.0]",
        ));
    }

    conn.execute(
        "INSERT INTO categories (name, description, parent_category_id,
                                 confidence_threshold, auto_generated, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            name,
            description,
            parent_category_id,
            threshold,
            auto_generated,
            now_stamp()
        ],
    )
    .map_err(|e| match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            MycelicError::AlreadyExists(format!("category already exists: {}", name))
        }
        _ => e.into(),
    })?;

    let id = conn.last_insert_rowid();
    get_category(conn, id)?.ok_or_else(|| MycelicError::not_found("category", id))
}

pub fn get_category(conn: &Connection, id: i64) -> Result<Option<Category>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, name, description, parent_category_id, confidence_threshold,
                auto_generated, created_at
         FROM categories WHERE id = ?1",
    )?;
    Ok(stmt.query_row([id], category_from_row).optional()?)
}

pub fn list_categories(conn: &Connection) -> Result<Vec<Category>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, name, description, parent_category_id, confidence_threshold,
                auto_generated, created_at
         FROM categories ORDER BY name ASC",
    )?;
    let categories = stmt
        .query_map([], category_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(categories)
}

/// Delete a category; child categories keep their rows with a NULL parent
pub fn delete_category(conn: &Connection, id: i64) -> Result<()> {
    let changed = conn.execute("DELETE FROM categories WHERE id = ?1", [id])?;
    if changed == 0 {
        return Err(MycelicError::not_found("category", id));
    }
    Ok(())
}

/// Associate a memory with a category
pub fn categorize_memory(
    conn: &Connection,
    memory_id: MemoryId,
    category_id: i64,
    confidence: f64,
    reasoning: Option<&str>,
) -> Result<()> {
    if !(0.0..=1.0).contains(&confidence) {
        return Err(MycelicError::invalid(
            "confidence",
            "must be within [0.0, 1.0]",
        ));
    }
    conn.execute(
        "INSERT INTO memory_categorizations (memory_id, category_id, confidence, reasoning, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(memory_id, category_id) DO UPDATE SET
             confidence = excluded.confidence,
             reasoning = excluded.reasoning",
        params![memory_id, category_id, confidence, reasoning, now_stamp()],
    )
    .map_err(|e| match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            MycelicError::not_found("memory or category", format!("{memory_id}/{category_id}"))
        }
        _ => e.into(),
    })?;
    Ok(())
}

/// Categorizations for a memory
pub fn get_categorizations(conn: &Connection, memory_id: MemoryId) -> Result<Vec<Categorization>> {
    let mut stmt = conn.prepare_cached(
        "SELECT memory_id, category_id, confidence, reasoning, created_at
         FROM memory_categorizations WHERE memory_id = ?1",
    )?;
    let rows = stmt
        .query_map([memory_id], |row| {
            let created_at: String = row.get("created_at")?;
            Ok(Categorization {
                memory_id: row.get("memory_id")?,
                category_id: row.get("category_id")?,
                confidence: row.get("confidence")?,
                reasoning: row.get("reasoning")?,
                created_at: parse_stamp(&created_at),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn domain_from_row(row: &rusqlite::Row) -> rusqlite::Result<Domain> {
    let created_at: String = row.get("created_at")?;
    Ok(Domain {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        created_at: parse_stamp(&created_at),
    })
}

/// Create a domain; returns the existing row when the name is already present
pub fn ensure_domain(conn: &Connection, name: &str, description: Option<&str>) -> Result<Domain> {
    conn.execute(
        "INSERT INTO domains (name, description, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO NOTHING",
        params![name, description, now_stamp()],
    )?;
    get_domain_by_name(conn, name)?.ok_or_else(|| MycelicError::not_found("domain", name))
}

pub fn get_domain_by_name(conn: &Connection, name: &str) -> Result<Option<Domain>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, name, description, created_at FROM domains WHERE name = ?1",
    )?;
    Ok(stmt.query_row([name], domain_from_row).optional()?)
}

pub fn list_domains(conn: &Connection) -> Result<Vec<Domain>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, name, description, created_at FROM domains ORDER BY name ASC",
    )?;
    let domains = stmt
        .query_map([], domain_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(domains)
}

pub fn delete_domain(conn: &Connection, id: i64) -> Result<()> {
    let changed = conn.execute("DELETE FROM domains WHERE id = ?1", [id])?;
    if changed == 0 {
        return Err(MycelicError::not_found("domain", id));
    }
    Ok(())
}
