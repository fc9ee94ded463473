//! Two-tier embedding cache
//!
//! L1 is an in-memory LRU with TTL, keyed by SHA-256 of the normalized text
//! and model name, sharing vectors via `Arc<[f32]>`. L2 is a companion
//! SQLite file whose entries expire on a longer TTL and are pruned by a
//! background task once per hour.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::storage::queries::{embedding_from_blob, embedding_to_blob, now_stamp};

/// Interval between background prune passes
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Cache key for a (text, model) pair: SHA-256 over the normalized text and
/// model name. Normalization collapses whitespace and lowercases, so
/// trivially different renderings of the same text share one entry.
pub fn cache_key(text: &str, model: &str) -> String {
    let normalized = text
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0x1f]);
    hasher.update(model.as_bytes());
    hex::encode(hasher.finalize())
}

struct L1Entry {
    embedding: Arc<[f32]>,
    inserted_at: Instant,
    last_used: u64,
}

struct L1State {
    entries: HashMap<String, L1Entry>,
    clock: u64,
}

/// Counters shared for stats reporting
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l1_entries: usize,
}

/// Two-tier embedding cache
pub struct EmbeddingCache {
    l1: Mutex<L1State>,
    l1_capacity: usize,
    l1_ttl: Duration,
    l2: Option<Mutex<Connection>>,
    l2_ttl: Duration,
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
}

impl EmbeddingCache {
    /// In-memory only cache (tests, ephemeral runs)
    pub fn memory_only(l1_capacity: usize, l1_ttl: Duration) -> Self {
        Self {
            l1: Mutex::new(L1State {
                entries: HashMap::new(),
                clock: 0,
            }),
            l1_capacity,
            l1_ttl,
            l2: None,
            l2_ttl: Duration::from_secs(86_400),
            l1_hits: AtomicU64::new(0),
            l1_misses: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            l2_misses: AtomicU64::new(0),
        }
    }

    /// Cache backed by a persistent L2 companion file
    pub fn open(
        l2_path: impl AsRef<Path>,
        l1_capacity: usize,
        l1_ttl: Duration,
        l2_ttl: Duration,
    ) -> Result<Self> {
        let conn = Connection::open(l2_path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            CREATE TABLE IF NOT EXISTS embedding_cache (
                hash TEXT PRIMARY KEY,
                text_preview TEXT NOT NULL,
                model TEXT NOT NULL,
                vector BLOB NOT NULL,
                dimension INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                accessed_at TEXT NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_embedding_cache_created
                ON embedding_cache(created_at);
            "#,
        )?;

        let mut cache = Self::memory_only(l1_capacity, l1_ttl);
        cache.l2 = Some(Mutex::new(conn));
        cache.l2_ttl = l2_ttl;
        Ok(cache)
    }

    /// Look up an embedding: L1 first, then L2 with promotion
    pub fn get(&self, text: &str, model: &str) -> Option<Arc<[f32]>> {
        let key = cache_key(text, model);

        {
            let mut state = self.l1.lock();
            state.clock += 1;
            let clock = state.clock;
            if let Some(entry) = state.entries.get_mut(&key) {
                if entry.inserted_at.elapsed() <= self.l1_ttl {
                    entry.last_used = clock;
                    self.l1_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.embedding.clone());
                }
                state.entries.remove(&key);
            }
        }
        self.l1_misses.fetch_add(1, Ordering::Relaxed);

        if let Some(embedding) = self.l2_get(&key) {
            self.l2_hits.fetch_add(1, Ordering::Relaxed);
            let arc: Arc<[f32]> = embedding.into();
            self.l1_insert(key, arc.clone());
            return Some(arc);
        }
        self.l2_misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store an embedding in both tiers
    pub fn put(&self, text: &str, model: &str, embedding: &[f32]) {
        let key = cache_key(text, model);
        self.l2_put(&key, text, model, embedding);
        self.l1_insert(key, embedding.to_vec().into());
    }

    fn l1_insert(&self, key: String, embedding: Arc<[f32]>) {
        let mut state = self.l1.lock();
        state.clock += 1;
        let clock = state.clock;

        if state.entries.len() >= self.l1_capacity && !state.entries.contains_key(&key) {
            // Evict the least recently used entry
            if let Some(lru_key) = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                state.entries.remove(&lru_key);
            }
        }

        state.entries.insert(
            key,
            L1Entry {
                embedding,
                inserted_at: Instant::now(),
                last_used: clock,
            },
        );
    }

    fn l2_get(&self, key: &str) -> Option<Vec<f32>> {
        let l2 = self.l2.as_ref()?;
        let conn = l2.lock();

        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.l2_ttl).unwrap_or(chrono::Duration::hours(24));
        let row: Option<Vec<u8>> = conn
            .query_row(
                "SELECT vector FROM embedding_cache WHERE hash = ?1 AND created_at > ?2",
                params![key, cutoff.to_rfc3339()],
                |r| r.get(0),
            )
            .optional()
            .ok()
            .flatten();

        if row.is_some() {
            let _ = conn.execute(
                "UPDATE embedding_cache
                 SET accessed_at = ?1, access_count = access_count + 1
                 WHERE hash = ?2",
                params![now_stamp(), key],
            );
        }
        row.map(|blob| embedding_from_blob(&blob))
    }

    fn l2_put(&self, key: &str, text: &str, model: &str, embedding: &[f32]) {
        let Some(l2) = self.l2.as_ref() else { return };
        let conn = l2.lock();
        let preview: String = text.chars().take(120).collect();
        let now = now_stamp();
        let _ = conn.execute(
            "INSERT INTO embedding_cache
                 (hash, text_preview, model, vector, dimension, created_at, accessed_at, access_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0)
             ON CONFLICT(hash) DO UPDATE SET
                 vector = excluded.vector,
                 created_at = excluded.created_at,
                 accessed_at = excluded.accessed_at",
            params![
                key,
                preview,
                model,
                embedding_to_blob(embedding),
                embedding.len() as i64,
                now
            ],
        );
    }

    /// Remove expired L2 rows; returns the number deleted
    pub fn prune_l2(&self) -> usize {
        let Some(l2) = self.l2.as_ref() else { return 0 };
        let conn = l2.lock();
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.l2_ttl).unwrap_or(chrono::Duration::hours(24));
        conn.execute(
            "DELETE FROM embedding_cache WHERE created_at <= ?1",
            [cutoff.to_rfc3339()],
        )
        .unwrap_or(0)
    }

    /// Spawn the hourly L2 pruner
    pub fn spawn_pruner(cache: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let pruned = cache.prune_l2();
                if pruned > 0 {
                    tracing::debug!(pruned, "pruned expired embedding cache entries");
                }
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l1_misses: self.l1_misses.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            l2_misses: self.l2_misses.load(Ordering::Relaxed),
            l1_entries: self.l1.lock().entries.len(),
        }
    }

    pub fn clear(&self) {
        self.l1.lock().entries.clear();
        if let Some(l2) = self.l2.as_ref() {
            let _ = l2.lock().execute("DELETE FROM embedding_cache", []);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_stability() {
        let a = cache_key("Hello World", "model-a");
        let b = cache_key("  hello   world  ", "model-a");
        let c = cache_key("hello world", "model-b");
        let d = cache_key("different text", "model-a");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_l1_hit_and_miss() {
        let cache = EmbeddingCache::memory_only(16, Duration::from_secs(60));
        assert!(cache.get("text", "m").is_none());

        cache.put("text", "m", &[1.0, 2.0]);
        let hit = cache.get("text", "m").unwrap();
        assert_eq!(&*hit, &[1.0, 2.0]);

        let stats = cache.stats();
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.l1_misses, 1);
    }

    #[test]
    fn test_l1_ttl_expiry() {
        let cache = EmbeddingCache::memory_only(16, Duration::from_millis(1));
        cache.put("text", "m", &[1.0]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("text", "m").is_none());
    }

    #[test]
    fn test_l1_capacity_eviction() {
        let cache = EmbeddingCache::memory_only(2, Duration::from_secs(60));
        cache.put("a", "m", &[1.0]);
        cache.put("b", "m", &[2.0]);
        // Touch "a" so "b" becomes LRU
        cache.get("a", "m");
        cache.put("c", "m", &[3.0]);

        assert!(cache.get("a", "m").is_some());
        assert!(cache.get("b", "m").is_none());
        assert!(cache.get("c", "m").is_some());
    }

    #[test]
    fn test_l2_persistence_and_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let cache = EmbeddingCache::open(
            &path,
            16,
            Duration::from_secs(60),
            Duration::from_secs(3600),
        )
        .unwrap();
        cache.put("persisted", "m", &[0.5, 0.6]);
        drop(cache);

        // A fresh cache with a cold L1 should hit L2 and promote
        let cache = EmbeddingCache::open(
            &path,
            16,
            Duration::from_secs(60),
            Duration::from_secs(3600),
        )
        .unwrap();
        let hit = cache.get("persisted", "m").unwrap();
        assert_eq!(&*hit, &[0.5, 0.6]);
        let stats = cache.stats();
        assert_eq!(stats.l2_hits, 1);

        // Second lookup lands in L1
        cache.get("persisted", "m").unwrap();
        assert_eq!(cache.stats().l1_hits, 1);
    }

    #[test]
    fn test_l2_prune() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::open(
            dir.path().join("cache.db"),
            16,
            Duration::from_secs(60),
            Duration::from_millis(1),
        )
        .unwrap();
        cache.put("soon gone", "m", &[1.0]);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.prune_l2(), 1);
    }
}
