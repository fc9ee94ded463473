//! Provider implementations: HTTP clients and the deterministic fallback

use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::Duration;

use super::{ChatMessage, ChatProvider, EmbeddingGenerator, VectorHit, VectorStore};
use crate::error::{MycelicError, Result};
use crate::types::MemoryId;

/// Default per-request timeout for provider calls
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Collection name used in the vector store
pub const VECTOR_COLLECTION: &str = "memories";

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Embedding
// ---------------------------------------------------------------------------

/// HTTP embedding provider speaking the Ollama-compatible embeddings API
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

impl HttpEmbeddingProvider {
    pub fn new(base_url: String, model: String, dimensions: usize) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingGenerator for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(MycelicError::RateLimited(1));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = format!("embedding provider returned {}: {}", status, body);
            return if status.is_server_error() {
                Err(MycelicError::Unavailable(err))
            } else {
                Err(MycelicError::Embedding(err))
            };
        }

        let data: serde_json::Value = response.json().await?;
        let embedding: Vec<f32> = data["embedding"]
            .as_array()
            .ok_or_else(|| MycelicError::Embedding("missing embedding in response".to_string()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        if embedding.is_empty() {
            return Err(MycelicError::Embedding("empty embedding returned".to_string()));
        }
        Ok(embedding)
    }

    async fn available(&self) -> bool {
        self.client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn enabled(&self) -> bool {
        true
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Deterministic fallback embedder used when no provider is configured.
///
/// Hashes word tokens into a fixed number of buckets and L2-normalizes the
/// result, so equal texts always embed identically and related texts share
/// buckets. Quality is far below a learned model but keeps semantic and
/// hybrid search functional offline.
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub const MODEL_NAME: &'static str = "hash-fallback";

    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let digest = Sha256::digest(token.as_bytes());
        let index = u64::from_le_bytes(digest[..8].try_into().unwrap()) as usize % self.dimensions;
        // Sign derived from another hash byte spreads tokens across both
        // directions, reducing collisions between unrelated texts.
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let (index, sign) = self.bucket(token);
            vector[index] += sign;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingGenerator for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    async fn available(&self) -> bool {
        true
    }

    fn enabled(&self) -> bool {
        true
    }

    fn model_name(&self) -> &str {
        Self::MODEL_NAME
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ---------------------------------------------------------------------------
// Vector store
// ---------------------------------------------------------------------------

/// HTTP vector store speaking a Qdrant-compatible points API
pub struct HttpVectorStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVectorStore {
    pub fn new(base_url: String) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, VECTOR_COLLECTION)
    }

    fn check_status(status: reqwest::StatusCode, body: String) -> Result<()> {
        if status.as_u16() == 429 {
            return Err(MycelicError::RateLimited(1));
        }
        if status.is_server_error() {
            return Err(MycelicError::Unavailable(format!(
                "vector store returned {}: {}",
                status, body
            )));
        }
        if !status.is_success() {
            return Err(MycelicError::VectorStore(format!(
                "vector store returned {}: {}",
                status, body
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn upsert(
        &self,
        id: MemoryId,
        vector: &[f32],
        payload: serde_json::Value,
    ) -> Result<()> {
        let response = self
            .client
            .put(format!("{}/points", self.collection_url()))
            .json(&json!({
                "points": [{ "id": id, "vector": vector, "payload": payload }]
            }))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::check_status(status, body)
    }

    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let response = self
            .client
            .post(format!("{}/points/search", self.collection_url()))
            .json(&json!({ "vector": vector, "limit": k, "with_payload": true }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            Self::check_status(status, body)?;
            unreachable!("check_status always returns Err for a non-success status");
        }

        let data: serde_json::Value = response.json().await?;
        let hits = data["result"]
            .as_array()
            .map(|results| {
                results
                    .iter()
                    .filter_map(|hit| {
                        Some(VectorHit {
                            memory_id: hit["id"].as_i64()?,
                            score: hit["score"].as_f64()?,
                            payload: hit.get("payload").cloned(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(hits)
    }

    async fn delete(&self, ids: &[MemoryId]) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/points/delete", self.collection_url()))
            .json(&json!({ "points": ids }))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::check_status(status, body)
    }

    async fn available(&self) -> bool {
        self.client
            .get(self.collection_url())
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/collections/{}", self.base_url, name))
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// HTTP chat provider speaking the Ollama chat API
pub struct HttpChatProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl HttpChatProvider {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }
}

#[async_trait]
impl ChatProvider for HttpChatProvider {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "stream": false
            }))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(MycelicError::RateLimited(1));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = format!("chat provider returned {}: {}", status, body);
            return if status.is_server_error() {
                Err(MycelicError::Unavailable(err))
            } else {
                Err(MycelicError::Chat(err))
            };
        }

        let data: serde_json::Value = response.json().await?;
        data["message"]["content"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| MycelicError::Chat("missing message content".to_string()))
    }

    async fn available(&self) -> bool {
        self.client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// In-memory vector store for tests and single-process deployments
pub struct MemoryVectorStore {
    points: dashmap::DashMap<MemoryId, Vec<f32>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self {
            points: dashmap::DashMap::new(),
        }
    }
}

impl Default for MemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(
        &self,
        id: MemoryId,
        vector: &[f32],
        _payload: serde_json::Value,
    ) -> Result<()> {
        self.points.insert(id, vector.to_vec());
        Ok(())
    }

    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let mut hits: Vec<VectorHit> = self
            .points
            .iter()
            .map(|entry| VectorHit {
                memory_id: *entry.key(),
                score: cosine_similarity(vector, entry.value()) as f64,
                payload: None,
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, ids: &[MemoryId]) -> Result<()> {
        for id in ids {
            self.points.remove(id);
        }
        Ok(())
    }

    async fn available(&self) -> bool {
        true
    }

    async fn collection_exists(&self, _name: &str) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_embedder_deterministic() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed_sync("concurrency with channels");
        let b = embedder.embed_sync("concurrency with channels");
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
    }

    #[test]
    fn test_hash_embedder_normalized() {
        let embedder = HashEmbedder::default();
        let v = embedder.embed_sync("some text to embed");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_shared_tokens_more_similar() {
        let embedder = HashEmbedder::default();
        let base = embedder.embed_sync("goroutines share memory by communicating");
        let related = embedder.embed_sync("goroutines communicate over channels");
        let unrelated = embedder.embed_sync("quarterly financial report spreadsheet");
        assert!(
            cosine_similarity(&base, &related) > cosine_similarity(&base, &unrelated),
            "related texts should score higher than unrelated"
        );
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        let a = vec![1.0, 0.0];
        assert!((cosine_similarity(&a, &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&a, &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_memory_vector_store_ranking() {
        let store = MemoryVectorStore::new();
        store.upsert(1, &[1.0, 0.0], serde_json::Value::Null).await.unwrap();
        store.upsert(2, &[0.9, 0.1], serde_json::Value::Null).await.unwrap();
        store.upsert(3, &[0.0, 1.0], serde_json::Value::Null).await.unwrap();

        let hits = store.search(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].memory_id, 1);
        assert_eq!(hits[1].memory_id, 2);

        store.delete(&[1]).await.unwrap();
        let hits = store.search(&[1.0, 0.0], 3).await.unwrap();
        assert!(hits.iter().all(|h| h.memory_id != 1));
    }
}
