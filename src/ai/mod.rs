//! AI manager: uniform access to embedding, vector store, and chat providers
//!
//! Shields the core from provider failures with an embedding cache, a
//! cached status snapshot, and retry with backoff on transient errors.

pub mod analyze;
pub mod cache;
pub mod providers;
pub mod retry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{MycelicError, Result};
use crate::storage::{queries, Storage};
use crate::types::MemoryId;

pub use cache::EmbeddingCache;
pub use providers::{
    cosine_similarity, HashEmbedder, HttpChatProvider, HttpEmbeddingProvider, HttpVectorStore,
    MemoryVectorStore, VECTOR_COLLECTION,
};
pub use retry::RetryPolicy;

/// How long a status snapshot stays fresh
const STATUS_TTL: Duration = Duration::from_secs(10);

/// Generates fixed-dimension embeddings for text
#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    async fn available(&self) -> bool;
    fn enabled(&self) -> bool;
    fn model_name(&self) -> &str;
    fn dimensions(&self) -> usize;
}

/// One nearest-neighbor hit from the vector store
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub memory_id: MemoryId,
    pub score: f64,
    pub payload: Option<serde_json::Value>,
}

/// Stores vectors and answers nearest-neighbor queries
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, id: MemoryId, vector: &[f32], payload: serde_json::Value)
        -> Result<()>;
    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>>;
    async fn delete(&self, ids: &[MemoryId]) -> Result<()>;
    async fn available(&self) -> bool;
    async fn collection_exists(&self, name: &str) -> Result<bool>;
}

/// A single chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Chat completion provider
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String>;
    async fn available(&self) -> bool;
}

/// Snapshot of provider liveness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiStatus {
    pub embedding_available: bool,
    pub vector_store_available: bool,
    pub chat_available: bool,
    pub embedding_model: String,
    pub last_error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Uniform access point for the external AI providers
pub struct AiManager {
    embedder: Arc<dyn EmbeddingGenerator>,
    vector_store: Option<Arc<dyn VectorStore>>,
    chat: Option<Arc<dyn ChatProvider>>,
    cache: Arc<EmbeddingCache>,
    retry_policy: RetryPolicy,
    status: RwLock<Option<(AiStatus, Instant)>>,
    last_error: RwLock<Option<String>>,
}

impl AiManager {
    /// Assemble from configuration. Without an embedding URL the
    /// deterministic fallback embedder keeps semantic search working.
    pub fn from_config(config: &Config) -> Result<Self> {
        let embedder: Arc<dyn EmbeddingGenerator> = match &config.embedding_url {
            Some(url) => Arc::new(HttpEmbeddingProvider::new(
                url.clone(),
                config.embedding_model.clone(),
                768,
            )),
            None => Arc::new(HashEmbedder::default()),
        };

        let vector_store: Option<Arc<dyn VectorStore>> = config
            .vector_url
            .as_ref()
            .map(|url| Arc::new(HttpVectorStore::new(url.clone())) as Arc<dyn VectorStore>);

        let chat: Option<Arc<dyn ChatProvider>> = config.chat_url.as_ref().map(|url| {
            Arc::new(HttpChatProvider::new(url.clone(), config.chat_model.clone()))
                as Arc<dyn ChatProvider>
        });

        let cache = if config.embedding_url.is_some() || config.vector_url.is_some() {
            config.ensure_data_dir()?;
            Arc::new(EmbeddingCache::open(
                config.embedding_cache_path(),
                config.l1_cache_capacity,
                config.l1_ttl,
                config.l2_ttl,
            )?)
        } else {
            Arc::new(EmbeddingCache::memory_only(
                config.l1_cache_capacity,
                config.l1_ttl,
            ))
        };

        Ok(Self {
            embedder,
            vector_store,
            chat,
            cache,
            retry_policy: RetryPolicy::default(),
            status: RwLock::new(None),
            last_error: RwLock::new(None),
        })
    }

    /// Build with explicit providers (tests, embedded deployments)
    pub fn with_providers(
        embedder: Arc<dyn EmbeddingGenerator>,
        vector_store: Option<Arc<dyn VectorStore>>,
        chat: Option<Arc<dyn ChatProvider>>,
        cache: Arc<EmbeddingCache>,
    ) -> Self {
        Self {
            embedder,
            vector_store,
            chat,
            cache,
            retry_policy: RetryPolicy::default(),
            status: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    pub fn embedding_model(&self) -> &str {
        self.embedder.model_name()
    }

    pub fn has_vector_store(&self) -> bool {
        self.vector_store.is_some()
    }

    pub fn has_chat(&self) -> bool {
        self.chat.is_some()
    }

    pub fn chat_provider(&self) -> Option<&Arc<dyn ChatProvider>> {
        self.chat.as_ref()
    }

    fn note_error(&self, error: &MycelicError) {
        *self.last_error.write() = Some(error.to_string());
    }

    /// Embed text through the two-tier cache; a cold miss calls the
    /// provider exactly once and stores the result in both tiers.
    pub async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>> {
        let model = self.embedder.model_name().to_string();
        if let Some(cached) = self.cache.get(text, &model) {
            return Ok(cached.to_vec());
        }

        let embedder = Arc::clone(&self.embedder);
        let owned = text.to_string();
        let result = retry::retry(&self.retry_policy, cancel, "embed", || {
            let embedder = Arc::clone(&embedder);
            let text = owned.clone();
            async move { embedder.embed(&text).await }
        })
        .await;

        match result {
            Ok(embedding) => {
                self.cache.put(text, &model, &embedding);
                Ok(embedding)
            }
            Err(e) => {
                self.note_error(&e);
                Err(e)
            }
        }
    }

    /// Embed a memory's content and persist it: blob in the main store,
    /// point in the vector store when one is configured.
    pub async fn embed_and_store(
        &self,
        storage: &Storage,
        memory_id: MemoryId,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let embedding = self.embed(content, cancel).await?;
        let model = self.embedder.model_name().to_string();

        storage.with_writer(|conn| {
            queries::store_embedding(conn, memory_id, &embedding, &model, VECTOR_COLLECTION)
        })?;

        if let Some(store) = &self.vector_store {
            let payload = serde_json::json!({ "memory_id": memory_id });
            if let Err(e) = store.upsert(memory_id, &embedding, payload).await {
                // The SQLite blob is authoritative; vector-store lag is
                // repaired on the next write.
                tracing::warn!(memory_id, "vector store upsert failed: {}", e);
                self.note_error(&e);
            }
        }
        Ok(())
    }

    /// Spawn embedding persistence in the background after a write
    pub fn spawn_embed(self: Arc<Self>, storage: Storage, memory_id: MemoryId, content: String) {
        let manager = self;
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            if let Err(e) = manager
                .embed_and_store(&storage, memory_id, &content, &cancel)
                .await
            {
                tracing::warn!(memory_id, "background embedding failed: {}", e);
            }
        });
    }

    /// Nearest neighbors for a query vector via the configured vector store
    pub async fn vector_search(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let store = self
            .vector_store
            .as_ref()
            .ok_or_else(|| MycelicError::Unavailable("no vector store configured".to_string()))?;
        store.search(vector, k).await.map_err(|e| {
            self.note_error(&e);
            e
        })
    }

    /// Drop vectors for deleted memories
    pub async fn delete_vectors(&self, ids: &[MemoryId]) -> Result<()> {
        if let Some(store) = &self.vector_store {
            store.delete(ids).await?;
        }
        Ok(())
    }

    /// Provider liveness snapshot, cached for a few seconds so hot paths
    /// never probe providers directly.
    pub async fn get_status(&self) -> AiStatus {
        if let Some((status, at)) = self.status.read().clone() {
            if at.elapsed() < STATUS_TTL {
                return status;
            }
        }

        let embedding_available = self.embedder.available().await;
        let vector_store_available = match &self.vector_store {
            Some(store) => store.available().await,
            None => false,
        };
        let chat_available = match &self.chat {
            Some(chat) => chat.available().await,
            None => false,
        };

        let status = AiStatus {
            embedding_available,
            vector_store_available,
            chat_available,
            embedding_model: self.embedder.model_name().to_string(),
            last_error: self.last_error.read().clone(),
            checked_at: Utc::now(),
        };
        *self.status.write() = Some((status.clone(), Instant::now()));
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Embedder that counts provider calls
    struct CountingEmbedder {
        inner: HashEmbedder,
        calls: AtomicU32,
    }

    #[async_trait]
    impl EmbeddingGenerator for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.inner.embed_sync(text))
        }

        async fn available(&self) -> bool {
            true
        }

        fn enabled(&self) -> bool {
            true
        }

        fn model_name(&self) -> &str {
            "counting"
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }
    }

    fn manager_with_counter() -> (Arc<AiManager>, Arc<CountingEmbedder>) {
        let embedder = Arc::new(CountingEmbedder {
            inner: HashEmbedder::default(),
            calls: AtomicU32::new(0),
        });
        let manager = Arc::new(AiManager::with_providers(
            embedder.clone(),
            Some(Arc::new(MemoryVectorStore::new())),
            None,
            Arc::new(EmbeddingCache::memory_only(64, Duration::from_secs(60))),
        ));
        (manager, embedder)
    }

    #[tokio::test]
    async fn test_cold_miss_calls_provider_once() {
        let (manager, embedder) = manager_with_counter();
        let cancel = CancellationToken::new();

        manager.embed("cache me", &cancel).await.unwrap();
        manager.embed("cache me", &cancel).await.unwrap();
        manager.embed("cache me", &cancel).await.unwrap();

        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_embed_and_store_persists_blob() {
        let (manager, _) = manager_with_counter();
        let storage = Storage::open_in_memory().unwrap();
        let id = storage
            .with_writer(|conn| {
                queries::insert_memory(
                    conn,
                    &queries::NewMemory {
                        content: "to embed".into(),
                        source: None,
                        importance: 5,
                        tags: vec![],
                        session_id: None,
                        domain: None,
                        agent_type: crate::types::AgentType::Unknown,
                        access_scope: crate::types::AccessScope::Session,
                        slug: None,
                        parent_memory_id: None,
                        chunk_level: 0,
                        chunk_index: None,
                        source_id: None,
                        external_id: None,
                    },
                )
            })
            .unwrap();

        let cancel = CancellationToken::new();
        manager
            .embed_and_store(&storage, id, "to embed", &cancel)
            .await
            .unwrap();

        let embedding = storage
            .with_reader(|conn| queries::get_embedding(conn, id))
            .unwrap();
        assert!(embedding.is_some());

        let hits = manager
            .vector_search(&manager.embed("to embed", &cancel).await.unwrap(), 5)
            .await
            .unwrap();
        assert_eq!(hits[0].memory_id, id);
    }

    #[tokio::test]
    async fn test_status_snapshot_cached() {
        let (manager, _) = manager_with_counter();
        let first = manager.get_status().await;
        assert!(first.embedding_available);
        assert!(first.vector_store_available);
        assert!(!first.chat_available);

        let second = manager.get_status().await;
        assert_eq!(first.checked_at, second.checked_at);
    }
}
