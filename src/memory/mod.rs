//! Memory service: policy over storage
//!
//! Validates inputs, attributes writes to a session, chunks oversized
//! content, and maps row-level absence to the NotFound error the
//! front-ends expect.

pub mod chunking;
pub mod validate;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{MycelicError, Result};
use crate::storage::queries::{self, MemoryPatch, NewMemory};
use crate::storage::{sessions, sources, Storage};
use crate::types::*;

/// Resolves the current session when a write does not name one.
/// Must be idempotent for the lifetime of one logical operation.
pub trait SessionResolver: Send + Sync {
    fn resolve_session(&self, agent_type: AgentType, hint: Option<&str>) -> Result<String>;
}

/// Default resolver: uses the hint when given, otherwise mints one session
/// id per process and keeps returning it.
pub struct ProcessSessionResolver {
    current: Mutex<Option<String>>,
}

impl ProcessSessionResolver {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }
}

impl Default for ProcessSessionResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionResolver for ProcessSessionResolver {
    fn resolve_session(&self, _agent_type: AgentType, hint: Option<&str>) -> Result<String> {
        if let Some(hint) = hint {
            let hint = hint.trim();
            if hint.is_empty() {
                return Err(MycelicError::invalid("session_id", "resolver returned empty"));
            }
            return Ok(hint.to_string());
        }
        let mut current = self.current.lock();
        if let Some(ref id) = *current {
            return Ok(id.clone());
        }
        let id = uuid::Uuid::new_v4().to_string();
        *current = Some(id.clone());
        Ok(id)
    }
}

/// CRUD and chunking policy over the storage engine
pub struct MemoryService {
    storage: Storage,
    resolver: Arc<dyn SessionResolver>,
    session_hint: Option<String>,
    chunk_threshold_tokens: usize,
}

impl MemoryService {
    pub fn new(
        storage: Storage,
        resolver: Arc<dyn SessionResolver>,
        session_hint: Option<String>,
        chunk_threshold_tokens: usize,
    ) -> Self {
        Self {
            storage,
            resolver,
            session_hint,
            chunk_threshold_tokens,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Validate and normalize a create input into a row-ready value
    fn prepare(&self, input: &CreateMemoryInput) -> Result<NewMemory> {
        validate::validate_content(&input.content)?;
        let tags = validate::normalize_tags(&input.tags)?;
        let domain = input
            .domain
            .as_deref()
            .map(validate::normalize_domain)
            .transpose()?;
        let slug = input
            .slug
            .as_deref()
            .map(validate::validate_slug)
            .transpose()?;

        let session_id = match &input.session_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => self
                .resolver
                .resolve_session(input.agent_type, self.session_hint.as_deref())?,
        };
        if session_id.is_empty() {
            return Err(MycelicError::invalid("session_id", "resolver returned empty"));
        }

        Ok(NewMemory {
            content: input.content.clone(),
            source: input.source.clone(),
            importance: validate::clamp_importance(input.importance),
            tags,
            session_id: Some(session_id),
            domain,
            agent_type: input.agent_type,
            access_scope: input.access_scope.unwrap_or_default(),
            slug,
            parent_memory_id: None,
            chunk_level: 0,
            chunk_index: None,
            source_id: input.source_id,
            external_id: input.external_id.clone(),
        })
    }

    /// Store a memory, chunking oversized content in the same transaction
    pub fn store(&self, input: &CreateMemoryInput) -> Result<Memory> {
        let started = std::time::Instant::now();
        let new = self.prepare(input)?;
        let chunks = chunking::plan_chunks(&new.content, self.chunk_threshold_tokens);

        let id = self.storage.with_transaction(|conn| {
            let parent_id = queries::insert_memory(conn, &new)?;
            sessions::upsert_session(
                conn,
                new.session_id.as_deref().unwrap_or_default(),
                new.agent_type,
                None,
            )?;

            if let Some(ref pieces) = chunks {
                for piece in pieces {
                    let child = NewMemory {
                        content: piece.content.clone(),
                        source: new.source.clone(),
                        importance: new.importance,
                        tags: new.tags.clone(),
                        session_id: new.session_id.clone(),
                        domain: new.domain.clone(),
                        agent_type: new.agent_type,
                        access_scope: new.access_scope,
                        slug: None,
                        parent_memory_id: Some(parent_id),
                        chunk_level: piece.level,
                        chunk_index: Some(piece.index),
                        source_id: None,
                        external_id: None,
                    };
                    queries::insert_memory(conn, &child)?;
                }
            }

            crate::storage::metrics::record_metric(
                conn,
                "memory.store",
                started.elapsed().as_secs_f64() * 1000.0,
            )?;
            Ok(parent_id)
        })?;

        self.get(id, false)
    }

    /// Fetch a memory; optionally bump its access tracking
    pub fn get(&self, id: MemoryId, track_access: bool) -> Result<Memory> {
        let memory = self
            .storage
            .with_reader(|conn| queries::get_memory(conn, id))?
            .ok_or_else(|| MycelicError::memory_not_found(id))?;

        if track_access {
            self.storage
                .with_writer(|conn| queries::touch_memory(conn, id))?;
        }
        Ok(memory)
    }

    pub fn get_by_slug(&self, slug: &str) -> Result<Memory> {
        self.storage
            .with_reader(|conn| queries::get_memory_by_slug(conn, slug))?
            .ok_or_else(|| MycelicError::not_found("memory", slug))
    }

    /// Partial update; only supplied fields change
    pub fn update(&self, id: MemoryId, input: &UpdateMemoryInput) -> Result<Memory> {
        let mut patch = MemoryPatch::default();

        if let Some(ref content) = input.content {
            validate::validate_content(content)?;
            patch.content = Some(content.clone());
        }
        if let Some(ref source) = input.source {
            patch.source = Some(source.clone());
        }
        if let Some(importance) = input.importance {
            patch.importance = Some(validate::clamp_importance(Some(importance)));
        }
        if let Some(ref tags) = input.tags {
            patch.tags = Some(validate::normalize_tags(tags)?);
        }
        if let Some(ref domain) = input.domain {
            patch.domain = Some(validate::normalize_domain(domain)?);
        }
        if let Some(scope) = input.access_scope {
            patch.access_scope = Some(scope);
        }
        if let Some(ref slug) = input.slug {
            patch.slug = Some(validate::validate_slug(slug)?);
        }

        if patch.is_empty() {
            return Err(MycelicError::invalid("update", "no fields to update"));
        }

        self.storage
            .with_writer(|conn| queries::update_memory(conn, id, &patch))
    }

    /// Delete by id; cascades handle edges, categorizations, and chunks
    pub fn delete(&self, id: MemoryId) -> Result<()> {
        self.storage
            .with_writer(|conn| queries::delete_memory(conn, id))
    }

    pub fn list(&self, options: &ListOptions) -> Result<Vec<Memory>> {
        self.storage
            .with_reader(|conn| queries::list_memories(conn, options))
    }

    pub fn count(&self, filters: &SearchFilters) -> Result<i64> {
        self.storage
            .with_reader(|conn| queries::count_memories(conn, filters))
    }

    /// Children of a chunked memory, ordered by chunk index
    pub fn children(&self, parent_id: MemoryId) -> Result<Vec<Memory>> {
        // Parent must exist even when it has no chunks
        self.get(parent_id, false)?;
        self.storage
            .with_reader(|conn| queries::get_children(conn, parent_id))
    }

    /// Ingest an externally-sourced record with dedup on
    /// (source_id, external_id); chunks newly-created oversized content.
    pub fn ingest(&self, input: &CreateMemoryInput) -> Result<IngestOutcome> {
        let new = self.prepare(input)?;
        let chunks = chunking::plan_chunks(&new.content, self.chunk_threshold_tokens);

        self.storage.with_transaction(|conn| {
            let outcome = sources::ingest_memory(conn, &new)?;
            if outcome.created {
                if let Some(ref pieces) = chunks {
                    for piece in pieces {
                        let child = NewMemory {
                            content: piece.content.clone(),
                            source: new.source.clone(),
                            importance: new.importance,
                            tags: new.tags.clone(),
                            session_id: new.session_id.clone(),
                            domain: new.domain.clone(),
                            agent_type: new.agent_type,
                            access_scope: new.access_scope,
                            slug: None,
                            parent_memory_id: Some(outcome.memory_id),
                            chunk_level: piece.level,
                            chunk_index: Some(piece.index),
                            source_id: None,
                            external_id: None,
                        };
                        queries::insert_memory(conn, &child)?;
                    }
                }
            }
            Ok(outcome)
        })
    }

    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.with_reader(queries::storage_stats)
    }
}
