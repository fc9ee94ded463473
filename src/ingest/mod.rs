//! Ingestion subsystem: replay-safe import from external sources
//!
//! Each sync attempt opens a history row, pulls batches from the source
//! starting at its opaque resume position, funnels every item through the
//! deduplicating ingest path, and closes the row with final counters. A
//! fatal error marks both the history row and the source as failed. The
//! resume position is never interpreted here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use tokio_util::sync::CancellationToken;

use crate::error::{MycelicError, Result};
use crate::memory::MemoryService;
use crate::storage::{sources, Storage};
use crate::types::*;

/// One record pulled from an external source
#[derive(Debug, Clone)]
pub struct SourceItem {
    pub external_id: String,
    pub content: String,
    pub tags: Vec<String>,
    pub domain: Option<String>,
    pub source_label: Option<String>,
}

/// A batch of items plus the position to resume from next time.
/// `next_position = None` means the stream is exhausted.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub items: Vec<SourceItem>,
    pub next_position: Option<String>,
}

/// Contract a source type implements to be syncable.
/// The position token is opaque: produced and consumed only by the source.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch_batch(&self, position: Option<&str>) -> Result<SourceBatch>;
}

/// Result of one sync run
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub history_id: i64,
    pub items_processed: i64,
    pub memories_created: i64,
    pub duplicates_skipped: i64,
}

/// Orchestrates source registration and sync runs
pub struct IngestService {
    storage: Storage,
    memory: Arc<MemoryService>,
    /// Sources with a sync currently in flight
    in_flight: DashSet<i64>,
}

impl IngestService {
    pub fn new(storage: Storage, memory: Arc<MemoryService>) -> Self {
        Self {
            storage,
            memory,
            in_flight: DashSet::new(),
        }
    }

    pub fn register_source(
        &self,
        source_type: &str,
        name: &str,
        config: &HashMap<String, serde_json::Value>,
    ) -> Result<DataSource> {
        self.storage
            .with_writer(|conn| sources::create_source(conn, source_type, name, config))
    }

    pub fn get_source(&self, id: i64) -> Result<DataSource> {
        self.storage
            .with_reader(|conn| sources::get_source(conn, id))?
            .ok_or_else(|| MycelicError::not_found("data source", id))
    }

    pub fn list_sources(&self) -> Result<Vec<DataSource>> {
        self.storage.with_reader(sources::list_sources)
    }

    pub fn delete_source(&self, id: i64) -> Result<()> {
        self.storage
            .with_writer(|conn| sources::delete_source(conn, id))
    }

    pub fn sync_history(&self, source_id: i64, limit: i64) -> Result<Vec<SyncHistory>> {
        self.storage
            .with_reader(|conn| sources::list_sync_history(conn, source_id, limit))
    }

    /// Run one sync attempt against a fetcher for the given source
    pub async fn sync(
        &self,
        source_id: i64,
        fetcher: &dyn SourceFetcher,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome> {
        let source = self.get_source(source_id)?;
        if source.status == SourceStatus::Paused {
            return Err(MycelicError::invalid("source", "source is paused"));
        }
        if !self.in_flight.insert(source_id) {
            return Err(MycelicError::AlreadyExists(format!(
                "sync already running for source {}",
                source_id
            )));
        }

        let result = self.sync_inner(&source, fetcher, cancel).await;
        self.in_flight.remove(&source_id);
        result
    }

    async fn sync_inner(
        &self,
        source: &DataSource,
        fetcher: &dyn SourceFetcher,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome> {
        let history_id = self
            .storage
            .with_writer(|conn| sources::open_sync_history(conn, source.id))?;

        let mut items_processed: i64 = 0;
        let mut memories_created: i64 = 0;
        let mut duplicates_skipped: i64 = 0;
        let mut position = source.last_sync_position.clone();

        let run = async {
            loop {
                if cancel.is_cancelled() {
                    return Err(MycelicError::Cancelled);
                }

                let batch = fetcher.fetch_batch(position.as_deref()).await?;
                for item in &batch.items {
                    let input = CreateMemoryInput {
                        content: item.content.clone(),
                        source: item.source_label.clone(),
                        tags: item.tags.clone(),
                        domain: item.domain.clone(),
                        agent_type: AgentType::Api,
                        source_id: Some(source.id),
                        external_id: Some(item.external_id.clone()),
                        ..Default::default()
                    };
                    let outcome = self.memory.ingest(&input)?;
                    items_processed += 1;
                    if outcome.created {
                        memories_created += 1;
                    } else {
                        duplicates_skipped += 1;
                    }
                }

                match batch.next_position {
                    Some(next) => position = Some(next),
                    None => return Ok(()),
                }
            }
        };

        match run.await {
            Ok(()) => {
                self.storage.with_writer(|conn| {
                    sources::close_sync_history(
                        conn,
                        history_id,
                        items_processed,
                        memories_created,
                        duplicates_skipped,
                        SyncStatus::Completed,
                        None,
                    )?;
                    sources::set_sync_position(conn, source.id, position.as_deref())?;
                    sources::set_source_status(conn, source.id, SourceStatus::Active, None)
                })?;
                tracing::info!(
                    source_id = source.id,
                    items_processed,
                    memories_created,
                    duplicates_skipped,
                    "sync completed"
                );
                Ok(SyncOutcome {
                    history_id,
                    items_processed,
                    memories_created,
                    duplicates_skipped,
                })
            }
            Err(e) => {
                let message = e.to_string();
                self.storage.with_writer(|conn| {
                    sources::close_sync_history(
                        conn,
                        history_id,
                        items_processed,
                        memories_created,
                        duplicates_skipped,
                        SyncStatus::Failed,
                        Some(&message),
                    )?;
                    sources::set_source_status(
                        conn,
                        source.id,
                        SourceStatus::Error,
                        Some(&message),
                    )
                })?;
                tracing::warn!(source_id = source.id, "sync failed: {}", message);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ProcessSessionResolver;
    use parking_lot::Mutex;

    struct StaticFetcher {
        batches: Mutex<Vec<SourceBatch>>,
    }

    #[async_trait]
    impl SourceFetcher for StaticFetcher {
        async fn fetch_batch(&self, _position: Option<&str>) -> Result<SourceBatch> {
            let mut batches = self.batches.lock();
            if batches.is_empty() {
                Ok(SourceBatch {
                    items: vec![],
                    next_position: None,
                })
            } else {
                Ok(batches.remove(0))
            }
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl SourceFetcher for FailingFetcher {
        async fn fetch_batch(&self, _position: Option<&str>) -> Result<SourceBatch> {
            Err(MycelicError::Unavailable("source offline".into()))
        }
    }

    fn item(external_id: &str, content: &str) -> SourceItem {
        SourceItem {
            external_id: external_id.to_string(),
            content: content.to_string(),
            tags: vec![],
            domain: None,
            source_label: None,
        }
    }

    fn fixture() -> (IngestService, Storage) {
        let storage = Storage::open_in_memory().unwrap();
        let memory = Arc::new(MemoryService::new(
            storage.clone(),
            Arc::new(ProcessSessionResolver::new()),
            None,
            400,
        ));
        (IngestService::new(storage.clone(), memory), storage)
    }

    #[tokio::test]
    async fn test_sync_counts_and_position() {
        let (ingest, _storage) = fixture();
        let source = ingest
            .register_source("notes", "local", &HashMap::new())
            .unwrap();

        let fetcher = StaticFetcher {
            batches: Mutex::new(vec![
                SourceBatch {
                    items: vec![item("e1", "first"), item("e2", "second")],
                    next_position: Some("p1".into()),
                },
                SourceBatch {
                    items: vec![item("e3", "third")],
                    next_position: None,
                },
            ]),
        };

        let outcome = ingest
            .sync(source.id, &fetcher, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.items_processed, 3);
        assert_eq!(outcome.memories_created, 3);
        assert_eq!(outcome.duplicates_skipped, 0);

        let reloaded = ingest.get_source(source.id).unwrap();
        assert_eq!(reloaded.last_sync_position.as_deref(), Some("p1"));
        assert_eq!(reloaded.status, SourceStatus::Active);
    }

    #[tokio::test]
    async fn test_replay_skips_duplicates() {
        let (ingest, _storage) = fixture();
        let source = ingest
            .register_source("notes", "local", &HashMap::new())
            .unwrap();

        let make_fetcher = || StaticFetcher {
            batches: Mutex::new(vec![SourceBatch {
                items: vec![item("ext-1", "same item")],
                next_position: None,
            }]),
        };

        let first = ingest
            .sync(source.id, &make_fetcher(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.memories_created, 1);

        let second = ingest
            .sync(source.id, &make_fetcher(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.memories_created, 0);
        assert_eq!(second.duplicates_skipped, 1);

        let history = ingest.sync_history(source.id, 10).unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_sync_marks_source() {
        let (ingest, _storage) = fixture();
        let source = ingest
            .register_source("notes", "flaky", &HashMap::new())
            .unwrap();

        let err = ingest
            .sync(source.id, &FailingFetcher, &CancellationToken::new())
            .await;
        assert!(err.is_err());

        let reloaded = ingest.get_source(source.id).unwrap();
        assert_eq!(reloaded.status, SourceStatus::Error);
        assert!(reloaded.error_message.is_some());

        let history = ingest.sync_history(source.id, 10).unwrap();
        assert_eq!(history[0].status, SyncStatus::Failed);
    }
}
