//! Core types for MycelicMemory

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a memory
pub type MemoryId = i64;

/// Maximum content size in bytes (1 MB)
pub const MAX_CONTENT_BYTES: usize = 1024 * 1024;

/// Maximum number of tags per memory
pub const MAX_TAGS: usize = 20;

/// Maximum length of a single tag
pub const MAX_TAG_LENGTH: usize = 50;

/// Maximum length of a domain name
pub const MAX_DOMAIN_LENGTH: usize = 100;

/// A memory entry in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// Unique identifier
    pub id: MemoryId,
    /// Main content of the memory
    pub content: String,
    /// Optional source label (e.g., a file path or conversation title)
    pub source: Option<String>,
    /// Importance score (1-10)
    #[serde(default = "default_importance")]
    pub importance: i32,
    /// Tags for categorization
    #[serde(default)]
    pub tags: Vec<String>,
    /// Session this memory belongs to
    pub session_id: Option<String>,
    /// Domain partition
    pub domain: Option<String>,
    /// Agent type that created the memory
    #[serde(default)]
    pub agent_type: AgentType,
    /// Access scope
    #[serde(default)]
    pub access_scope: AccessScope,
    /// Optional unique slug
    pub slug: Option<String>,
    /// Parent memory for chunks
    pub parent_memory_id: Option<MemoryId>,
    /// Chunk level: 0 = full, 1 = paragraph, 2 = atomic
    #[serde(default)]
    pub chunk_level: i32,
    /// Position within the parent when chunked
    pub chunk_index: Option<i32>,
    /// External data source reference
    pub source_id: Option<i64>,
    /// External record id within the data source
    pub external_id: Option<String>,
    /// Whether an embedding is stored for this memory
    #[serde(default)]
    pub has_embedding: bool,
    /// Number of times accessed
    #[serde(default)]
    pub access_count: i64,
    /// When the memory was last accessed
    pub last_accessed: Option<DateTime<Utc>>,
    /// When the memory was created
    pub created_at: DateTime<Utc>,
    /// When the memory was last updated
    pub updated_at: DateTime<Utc>,
}

fn default_importance() -> i32 {
    5
}

/// Agent type that produced a memory or owns a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Desktop,
    Code,
    Api,
    #[default]
    Unknown,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Desktop => "desktop",
            AgentType::Code => "code",
            AgentType::Api => "api",
            AgentType::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "desktop" => Ok(AgentType::Desktop),
            "code" => Ok(AgentType::Code),
            "api" => Ok(AgentType::Api),
            "unknown" => Ok(AgentType::Unknown),
            _ => Err(format!("Unknown agent type: {}", s)),
        }
    }
}

/// Access scope for a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessScope {
    #[default]
    Session,
    Shared,
    Global,
}

impl AccessScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessScope::Session => "session",
            AccessScope::Shared => "shared",
            AccessScope::Global => "global",
        }
    }
}

impl std::str::FromStr for AccessScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "session" => Ok(AccessScope::Session),
            "shared" => Ok(AccessScope::Shared),
            "global" => Ok(AccessScope::Global),
            _ => Err(format!("Unknown access scope: {}", s)),
        }
    }
}

/// Typed directed edge between two memories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: i64,
    pub source_memory_id: MemoryId,
    pub target_memory_id: MemoryId,
    pub relationship_type: RelationshipType,
    /// Strength in [0.0, 1.0]
    pub strength: f64,
    /// Free-text context explaining the edge
    pub context: Option<String>,
    /// Whether the edge was discovered automatically
    #[serde(default)]
    pub auto_generated: bool,
    pub created_at: DateTime<Utc>,
}

/// Types of relationships between memories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipType {
    #[default]
    References,
    Contradicts,
    Expands,
    Similar,
    Sequential,
    Causes,
    Enables,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::References => "references",
            RelationshipType::Contradicts => "contradicts",
            RelationshipType::Expands => "expands",
            RelationshipType::Similar => "similar",
            RelationshipType::Sequential => "sequential",
            RelationshipType::Causes => "causes",
            RelationshipType::Enables => "enables",
        }
    }

    pub fn all() -> &'static [RelationshipType] {
        &[
            RelationshipType::References,
            RelationshipType::Contradicts,
            RelationshipType::Expands,
            RelationshipType::Similar,
            RelationshipType::Sequential,
            RelationshipType::Causes,
            RelationshipType::Enables,
        ]
    }
}

impl std::str::FromStr for RelationshipType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "references" => Ok(RelationshipType::References),
            "contradicts" => Ok(RelationshipType::Contradicts),
            "expands" => Ok(RelationshipType::Expands),
            "similar" => Ok(RelationshipType::Similar),
            "sequential" => Ok(RelationshipType::Sequential),
            "causes" => Ok(RelationshipType::Causes),
            "enables" => Ok(RelationshipType::Enables),
            _ => Err(format!("Unknown relationship type: {}", s)),
        }
    }
}

/// Hierarchical category label
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub parent_category_id: Option<i64>,
    /// Confidence threshold for auto-categorization, [0, 1]
    pub confidence_threshold: f64,
    pub auto_generated: bool,
    pub created_at: DateTime<Utc>,
}

/// (memory, category) association
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Categorization {
    pub memory_id: MemoryId,
    pub category_id: i64,
    pub confidence: f64,
    pub reasoning: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Named partition for organizing memories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-agent execution context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub agent_type: AgentType,
    pub agent_context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub active: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Data source lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    #[default]
    Active,
    Paused,
    Error,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Active => "active",
            SourceStatus::Paused => "paused",
            SourceStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for SourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(SourceStatus::Active),
            "paused" => Ok(SourceStatus::Paused),
            "error" => Ok(SourceStatus::Error),
            _ => Err(format!("Unknown source status: {}", s)),
        }
    }
}

/// External ingestion endpoint registry entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: i64,
    pub source_type: String,
    pub name: String,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    pub status: SourceStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Opaque resumption token, interpreted only by the source
    pub last_sync_position: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Status of a single sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(SyncStatus::Running),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            _ => Err(format!("Unknown sync status: {}", s)),
        }
    }
}

/// One row per sync attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHistory {
    pub id: i64,
    pub source_id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub items_processed: i64,
    pub memories_created: i64,
    pub duplicates_skipped: i64,
    pub status: SyncStatus,
    pub error_message: Option<String>,
}

/// Per-memory vector record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub memory_id: MemoryId,
    pub vector_index: String,
    pub embedding_model: String,
    pub dimension: i32,
    pub last_updated: DateTime<Utc>,
}

/// Input for creating a new memory
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateMemoryInput {
    pub content: String,
    pub source: Option<String>,
    pub importance: Option<i32>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub session_id: Option<String>,
    pub domain: Option<String>,
    #[serde(default)]
    pub agent_type: AgentType,
    pub access_scope: Option<AccessScope>,
    pub slug: Option<String>,
    /// External reference for ingest deduplication
    pub source_id: Option<i64>,
    pub external_id: Option<String>,
}

/// Input for updating a memory; only supplied fields change
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateMemoryInput {
    pub content: Option<String>,
    pub source: Option<String>,
    pub importance: Option<i32>,
    pub tags: Option<Vec<String>>,
    pub domain: Option<String>,
    pub access_scope: Option<AccessScope>,
    pub slug: Option<String>,
}

/// Input for creating a relationship
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRelationshipInput {
    pub source_memory_id: MemoryId,
    pub target_memory_id: MemoryId,
    #[serde(default)]
    pub relationship_type: RelationshipType,
    pub strength: Option<f64>,
    pub context: Option<String>,
    #[serde(default)]
    pub auto_generated: bool,
}

/// Filters applicable to list and search operations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    pub session_id: Option<String>,
    pub domain: Option<String>,
    pub min_importance: Option<i32>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Memory must carry every listed tag
    pub tags: Option<Vec<String>>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none()
            && self.domain.is_none()
            && self.min_importance.is_none()
            && self.created_after.is_none()
            && self.created_before.is_none()
            && self.tags.as_ref().map_or(true, |t| t.is_empty())
    }
}

/// Search mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Keyword,
    Semantic,
    #[default]
    Hybrid,
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keyword" => Ok(SearchMode::Keyword),
            "semantic" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            _ => Err(format!("Unknown search mode: {}", s)),
        }
    }
}

/// Options for search operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    #[serde(default)]
    pub mode: SearchMode,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub min_relevance: Option<f64>,
    #[serde(default)]
    pub filters: SearchFilters,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            mode: SearchMode::Hybrid,
            limit: Some(10),
            offset: None,
            min_relevance: None,
            filters: SearchFilters::default(),
        }
    }
}

/// How a search result matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Keyword,
    Semantic,
    Hybrid,
}

/// A single search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub memory: Memory,
    /// Relevance in [0, 1] for single-mode, weighted sum for hybrid
    pub relevance: f64,
    pub match_type: MatchType,
}

/// A page of search results with degradation warnings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub has_next_page: bool,
    pub has_previous_page: bool,
    /// Set when one side of a hybrid search failed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Node returned by graph traversal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: MemoryId,
    /// Content preview truncated to 200 chars
    pub content_preview: String,
    pub importance: i32,
    pub domain: Option<String>,
    pub tags: Vec<String>,
    pub session_id: Option<String>,
    /// Relationship hops from the root
    pub distance: i32,
}

/// Edge returned by graph traversal, direction preserved
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source_memory_id: MemoryId,
    pub target_memory_id: MemoryId,
    pub relationship_type: RelationshipType,
    pub strength: f64,
}

/// Bounded traversal result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryGraph {
    pub root_id: MemoryId,
    pub max_depth: i32,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// Options for listing memories
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListOptions {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    #[serde(default)]
    pub filters: SearchFilters,
}

/// Outcome of an ingest call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub memory_id: MemoryId,
    /// False when the (source_id, external_id) pair already existed
    pub created: bool,
}

/// Statistics about the memory store
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageStats {
    pub total_memories: i64,
    pub total_relationships: i64,
    pub total_categories: i64,
    pub total_domains: i64,
    pub total_sessions: i64,
    pub memories_with_embeddings: i64,
    pub db_size_bytes: i64,
    pub schema_version: i32,
    pub domain_counts: HashMap<String, i64>,
}

/// Truncate content to a preview of at most `max_chars` characters
pub fn content_preview(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        content.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relationship_type_round_trip() {
        for rt in RelationshipType::all() {
            assert_eq!(rt.as_str().parse::<RelationshipType>().unwrap(), *rt);
        }
    }

    #[test]
    fn test_agent_type_parsing() {
        assert_eq!("code".parse::<AgentType>().unwrap(), AgentType::Code);
        assert_eq!("DESKTOP".parse::<AgentType>().unwrap(), AgentType::Desktop);
        assert!("robot".parse::<AgentType>().is_err());
    }

    #[test]
    fn test_content_preview_respects_char_boundaries() {
        let s = "héllo wörld";
        let p = content_preview(s, 4);
        assert_eq!(p, "héll");
    }

    #[test]
    fn test_search_filters_is_empty() {
        assert!(SearchFilters::default().is_empty());
        let f = SearchFilters {
            domain: Some("programming".into()),
            ..Default::default()
        };
        assert!(!f.is_empty());
    }
}
