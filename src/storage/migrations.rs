//! Database migrations
//!
//! `schema_version` holds the highest applied version. Missing migrations
//! run in order on startup, each inside one transaction, each recording its
//! version on success and appending to `migration_log`. Re-running against a
//! partially-applied database must not fail: duplicate-column ALTER errors
//! are downgraded to warnings.

use rusqlite::Connection;

use crate::error::{MycelicError, Result};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migration_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply(conn, 1, "base schema", migrate_v1)?;
    }
    if current_version < 2 {
        apply(conn, 2, "access tracking, tiers, entities", migrate_v2)?;
    }
    if current_version < 3 {
        apply(conn, 3, "data sources and external ids", migrate_v3)?;
    }

    Ok(())
}

/// Run one migration in a transaction and record it
fn apply(
    conn: &Connection,
    version: i32,
    description: &str,
    migration: fn(&Connection) -> Result<()>,
) -> Result<()> {
    tracing::info!(version, description, "applying migration");

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = migration(conn).and_then(|_| {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [version],
        )?;
        conn.execute(
            "INSERT INTO migration_log (version, description) VALUES (?1, ?2)",
            rusqlite::params![version, description],
        )?;
        Ok(())
    });

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(MycelicError::Migration {
                version,
                message: e.to_string(),
            })
        }
    }
}

/// Add a column, tolerating a previous partial run that already added it
fn add_column(conn: &Connection, table: &str, column_def: &str) -> Result<()> {
    let sql = format!("ALTER TABLE {} ADD COLUMN {}", table, column_def);
    match conn.execute(&sql, []) {
        Ok(_) => Ok(()),
        Err(e) if e.to_string().contains("duplicate column name") => {
            tracing::warn!(table, column_def, "column already present, skipping");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Initial schema (v1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Memories: the central table
        CREATE TABLE IF NOT EXISTS memories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content TEXT NOT NULL CHECK (length(content) > 0),
            source TEXT,
            importance INTEGER NOT NULL DEFAULT 5 CHECK (importance BETWEEN 1 AND 10),
            tags TEXT NOT NULL DEFAULT '[]',
            session_id TEXT,
            domain TEXT,
            agent_type TEXT NOT NULL DEFAULT 'unknown',
            access_scope TEXT NOT NULL DEFAULT 'session',
            slug TEXT,
            parent_memory_id INTEGER REFERENCES memories(id) ON DELETE CASCADE,
            chunk_level INTEGER NOT NULL DEFAULT 0,
            chunk_index INTEGER,
            embedding BLOB,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        -- Typed directed edges between memories
        CREATE TABLE IF NOT EXISTS memory_relationships (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_memory_id INTEGER NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
            target_memory_id INTEGER NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
            relationship_type TEXT NOT NULL,
            strength REAL NOT NULL DEFAULT 0.5 CHECK (strength BETWEEN 0.0 AND 1.0),
            context TEXT,
            auto_generated INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(source_memory_id, target_memory_id, relationship_type)
        );

        -- Hierarchical categories
        CREATE TABLE IF NOT EXISTS categories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            parent_category_id INTEGER REFERENCES categories(id) ON DELETE SET NULL,
            confidence_threshold REAL NOT NULL DEFAULT 0.7 CHECK (confidence_threshold BETWEEN 0.0 AND 1.0),
            auto_generated INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS memory_categorizations (
            memory_id INTEGER NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
            category_id INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
            confidence REAL NOT NULL DEFAULT 1.0 CHECK (confidence BETWEEN 0.0 AND 1.0),
            reasoning TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (memory_id, category_id)
        );

        CREATE TABLE IF NOT EXISTS domains (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS agent_sessions (
            session_id TEXT PRIMARY KEY,
            agent_type TEXT NOT NULL DEFAULT 'unknown',
            agent_context TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            last_accessed TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            active INTEGER NOT NULL DEFAULT 1,
            metadata TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS vector_metadata (
            memory_id INTEGER PRIMARY KEY REFERENCES memories(id) ON DELETE CASCADE,
            vector_index TEXT NOT NULL,
            embedding_model TEXT NOT NULL,
            dimension INTEGER NOT NULL,
            last_updated TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS performance_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation TEXT NOT NULL,
            duration_ms REAL NOT NULL,
            recorded_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        -- Standalone FTS index over the searchable columns; rowid mirrors
        -- memories.id so recovery needs no back-reference to the base table.
        CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
            content,
            source,
            tags,
            session_id,
            domain,
            slug,
            tokenize='porter unicode61'
        );

        -- Triggers keep the FTS index synchronized with the base table
        CREATE TRIGGER IF NOT EXISTS memories_fts_insert AFTER INSERT ON memories BEGIN
            INSERT INTO memories_fts(rowid, content, source, tags, session_id, domain, slug)
            VALUES (NEW.id, NEW.content, COALESCE(NEW.source, ''), NEW.tags,
                    COALESCE(NEW.session_id, ''), COALESCE(NEW.domain, ''), COALESCE(NEW.slug, ''));
        END;

        CREATE TRIGGER IF NOT EXISTS memories_fts_delete AFTER DELETE ON memories BEGIN
            DELETE FROM memories_fts WHERE rowid = OLD.id;
        END;

        CREATE TRIGGER IF NOT EXISTS memories_fts_update AFTER UPDATE ON memories
        WHEN OLD.content IS NOT NEW.content
          OR OLD.source IS NOT NEW.source
          OR OLD.tags IS NOT NEW.tags
          OR OLD.session_id IS NOT NEW.session_id
          OR OLD.domain IS NOT NEW.domain
          OR OLD.slug IS NOT NEW.slug
        BEGIN
            DELETE FROM memories_fts WHERE rowid = OLD.id;
            INSERT INTO memories_fts(rowid, content, source, tags, session_id, domain, slug)
            VALUES (NEW.id, NEW.content, COALESCE(NEW.source, ''), NEW.tags,
                    COALESCE(NEW.session_id, ''), COALESCE(NEW.domain, ''), COALESCE(NEW.slug, ''));
        END;

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_memories_session ON memories(session_id);
        CREATE INDEX IF NOT EXISTS idx_memories_domain ON memories(domain);
        CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance DESC);
        CREATE INDEX IF NOT EXISTS idx_memories_access_scope ON memories(access_scope);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_memories_slug ON memories(slug) WHERE slug IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_memories_parent ON memories(parent_memory_id);
        CREATE INDEX IF NOT EXISTS idx_memories_chunk_level ON memories(chunk_level);

        CREATE INDEX IF NOT EXISTS idx_relationships_source ON memory_relationships(source_memory_id);
        CREATE INDEX IF NOT EXISTS idx_relationships_target ON memory_relationships(target_memory_id);
        CREATE INDEX IF NOT EXISTS idx_relationships_type ON memory_relationships(relationship_type);
        CREATE INDEX IF NOT EXISTS idx_relationships_strength ON memory_relationships(strength DESC);
        CREATE INDEX IF NOT EXISTS idx_relationships_source_target
            ON memory_relationships(source_memory_id, target_memory_id);
        CREATE INDEX IF NOT EXISTS idx_relationships_target_source
            ON memory_relationships(target_memory_id, source_memory_id);
        CREATE INDEX IF NOT EXISTS idx_relationships_source_strength
            ON memory_relationships(source_memory_id, strength DESC);
        CREATE INDEX IF NOT EXISTS idx_relationships_target_strength
            ON memory_relationships(target_memory_id, strength DESC);

        CREATE INDEX IF NOT EXISTS idx_categorizations_category
            ON memory_categorizations(category_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_last_accessed
            ON agent_sessions(last_accessed DESC);
        CREATE INDEX IF NOT EXISTS idx_metrics_operation
            ON performance_metrics(operation, recorded_at DESC);
        "#,
    )?;

    Ok(())
}

/// Access tracking, tier lookup, and entity tables (v2)
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS memory_tiers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        INSERT OR IGNORE INTO memory_tiers (name, description) VALUES
            ('hot', 'Frequently accessed, kept fully indexed'),
            ('warm', 'Recently used'),
            ('cold', 'Rarely accessed'),
            ('archived', 'Retained for history only');
        "#,
    )?;

    add_column(conn, "memories", "last_accessed TEXT")?;
    add_column(conn, "memories", "access_count INTEGER NOT NULL DEFAULT 0")?;
    add_column(conn, "memories", "strength REAL NOT NULL DEFAULT 1.0")?;
    add_column(conn, "memories", "decay_score REAL NOT NULL DEFAULT 1.0")?;
    add_column(conn, "memories", "tier_id INTEGER REFERENCES memory_tiers(id)")?;

    conn.execute_batch(
        r#"
        -- Entities extracted from memory content
        CREATE TABLE IF NOT EXISTS entities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            entity_type TEXT NOT NULL DEFAULT 'concept',
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(normalized_name, entity_type)
        );

        CREATE TABLE IF NOT EXISTS memory_entities (
            memory_id INTEGER NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
            entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
            confidence REAL NOT NULL DEFAULT 1.0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (memory_id, entity_id)
        );

        CREATE INDEX IF NOT EXISTS idx_entities_normalized ON entities(normalized_name);
        CREATE INDEX IF NOT EXISTS idx_memory_entities_entity ON memory_entities(entity_id);
        "#,
    )?;

    Ok(())
}

/// External data sources and replay-safe ingestion (v3)
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS data_sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_type TEXT NOT NULL,
            name TEXT NOT NULL UNIQUE,
            config TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'active',
            last_sync_at TEXT,
            last_sync_position TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS data_source_sync_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL REFERENCES data_sources(id) ON DELETE CASCADE,
            started_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            completed_at TEXT,
            items_processed INTEGER NOT NULL DEFAULT 0,
            memories_created INTEGER NOT NULL DEFAULT 0,
            duplicates_skipped INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'running',
            error_message TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_history_source
            ON data_source_sync_history(source_id, started_at DESC);
        "#,
    )?;

    add_column(conn, "memories", "source_id INTEGER REFERENCES data_sources(id)")?;
    add_column(conn, "memories", "external_id TEXT")?;

    // At-most-once ingestion per external record
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_memories_source_external
         ON memories(source_id, external_id)
         WHERE source_id IS NOT NULL AND external_id IS NOT NULL",
        [],
    )?;

    Ok(())
}
