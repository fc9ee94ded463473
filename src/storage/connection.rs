//! Database connection management
//!
//! A single writer connection is serialized behind a mutex; reads go through
//! a small round-robin pool of additional connections. WAL journaling lets
//! readers proceed while a write is in flight. Write contention is retried
//! with exponential backoff before surfacing an error.

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::migrations::run_migrations;
use crate::error::{MycelicError, Result};

/// Number of reader connections in the pool
const READER_POOL_SIZE: usize = 4;

/// Write retry policy for transient lock errors
const WRITE_RETRIES: u32 = 3;
const WRITE_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const WRITE_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Storage engine wrapping SQLite with a writer gate and reader pool
pub struct Storage {
    db_path: PathBuf,
    writer: Arc<Mutex<Connection>>,
    readers: Vec<Arc<Mutex<Connection>>>,
    reader_interrupts: Vec<Arc<InterruptHandle>>,
    next_reader: Arc<AtomicUsize>,
}

/// A pooled reader connection plus its interrupt handle, for queries that
/// must be abortable from another task (graph traversal timeouts).
pub struct ReaderHandle {
    pub conn: Arc<Mutex<Connection>>,
    pub interrupt: Arc<InterruptHandle>,
}

impl Storage {
    /// Open or create a database at the given path
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let in_memory = db_path.to_str() == Some(":memory:");

        let writer_conn = Self::create_connection(&db_path)?;
        run_migrations(&writer_conn)?;

        let writer = Arc::new(Mutex::new(writer_conn));

        // A `:memory:` database is per-connection, so readers must share the
        // writer's connection in that mode.
        let (readers, reader_interrupts) = if in_memory {
            let interrupt = {
                let conn = writer.lock();
                Arc::new(conn.get_interrupt_handle())
            };
            (vec![writer.clone()], vec![interrupt])
        } else {
            let mut readers = Vec::with_capacity(READER_POOL_SIZE);
            let mut interrupts = Vec::with_capacity(READER_POOL_SIZE);
            for _ in 0..READER_POOL_SIZE {
                let conn = Self::create_connection(&db_path)?;
                interrupts.push(Arc::new(conn.get_interrupt_handle()));
                readers.push(Arc::new(Mutex::new(conn)));
            }
            (readers, interrupts)
        };

        Ok(Self {
            db_path,
            writer,
            readers,
            reader_interrupts,
            next_reader: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Open an in-memory database (used by tests)
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = if db_path.to_str() == Some(":memory:") {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            Connection::open_with_flags(db_path, flags)?
        };

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=30000;
            PRAGMA cache_size=-64000;
            PRAGMA temp_store=MEMORY;
            PRAGMA foreign_keys=ON;
            "#,
        )?;

        Ok(conn)
    }

    /// Execute a read with a pooled reader connection
    pub fn with_reader<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let handle = self.reader();
        let conn = handle.conn.lock();
        f(&conn)
    }

    /// Get a reader connection plus its interrupt handle (round-robin)
    pub fn reader(&self) -> ReaderHandle {
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        ReaderHandle {
            conn: self.readers[idx].clone(),
            interrupt: self.reader_interrupts[idx].clone(),
        }
    }

    /// Execute a write under the writer gate, retrying transient lock errors
    pub fn with_writer<F, T>(&self, f: F) -> Result<T>
    where
        F: Fn(&Connection) -> Result<T>,
    {
        let mut backoff = WRITE_BACKOFF_INITIAL;
        let mut attempt = 0;
        loop {
            let result = {
                let conn = self.writer.lock();
                f(&conn)
            };
            match result {
                Err(e) if e.is_lock_contention() && attempt < WRITE_RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "write contention, retrying: {}",
                        e
                    );
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(WRITE_BACKOFF_CAP);
                }
                other => return other,
            }
        }
    }

    /// Execute a write inside a transaction under the writer gate
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: Fn(&Connection) -> Result<T>,
    {
        self.with_writer(|conn| {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            match f(conn) {
                Ok(value) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(value)
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
        })
    }

    /// Hold the writer gate directly (migrations, maintenance)
    pub fn writer_guard(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock()
    }

    /// Database path
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Database size in bytes
    pub fn db_size(&self) -> Result<i64> {
        self.with_reader(|conn| {
            let size: i64 = conn.query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )?;
            Ok(size)
        })
    }

    /// Checkpoint the WAL file
    pub fn checkpoint(&self) -> Result<()> {
        self.with_writer(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
            Ok(())
        })
    }

    /// Compare FTS index and base table row counts. Mismatches are reported,
    /// not fatal; reads continue against the base table.
    pub fn verify_fts_integrity(&self) -> Result<bool> {
        self.with_reader(|conn| {
            let base: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?;
            let fts: i64 = conn.query_row("SELECT COUNT(*) FROM memories_fts", [], |r| r.get(0))?;
            if base != fts {
                tracing::warn!(base, fts, "FTS index out of sync with memories table");
            }
            Ok(base == fts)
        })
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            db_path: self.db_path.clone(),
            writer: self.writer.clone(),
            readers: self.readers.clone(),
            reader_interrupts: self.reader_interrupts.clone(),
            next_reader: self.next_reader.clone(),
        }
    }
}

impl MycelicError {
    /// True when the underlying SQLite error is a transient lock failure
    pub(crate) fn is_lock_contention(&self) -> bool {
        matches!(
            self,
            MycelicError::Database(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let storage = Storage::open_in_memory().unwrap();
        assert_eq!(storage.db_path().to_str(), Some(":memory:"));
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("test.db")).unwrap();
        let version: i32 = storage
            .with_reader(|conn| {
                Ok(conn.query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert!(version >= 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let storage = Storage::open_in_memory().unwrap();
        let result: Result<()> = storage.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO domains (name) VALUES (?1)",
                ["rollback-probe"],
            )?;
            Err(MycelicError::Internal("forced".into()))
        });
        assert!(result.is_err());

        let count: i64 = storage
            .with_reader(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM domains WHERE name = 'rollback-probe'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_fts_integrity_clean() {
        let storage = Storage::open_in_memory().unwrap();
        assert!(storage.verify_fts_integrity().unwrap());
    }
}
