//! MCP tool definitions and dispatch

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::protocol::{
    methods, InitializeResult, McpHandler, McpRequest, McpResponse, ToolCallResult,
    ToolDefinition,
};
use crate::ai::{analyze, AiManager};
use crate::error::{MycelicError, Result};
use crate::graph::GraphService;
use crate::ingest::IngestService;
use crate::memory::MemoryService;
use crate::search::SearchEngine;
use crate::storage::{sessions, taxonomy, Storage};
use crate::types::*;

/// Per-tool-call deadline
const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Tool table: (name, description, JSON schema for parameters)
pub const TOOL_DEFINITIONS: &[(&str, &str, &str)] = &[
    (
        "store_memory",
        "Store a new memory with tags, importance, and domain",
        r#"{
            "type": "object",
            "properties": {
                "content": {"type": "string", "description": "The content to remember"},
                "source": {"type": "string", "description": "Optional source label"},
                "importance": {"type": "integer", "minimum": 1, "maximum": 10, "default": 5},
                "tags": {"type": "array", "items": {"type": "string"}, "maxItems": 20},
                "session_id": {"type": "string", "description": "Session to attribute; resolved automatically when omitted"},
                "domain": {"type": "string", "description": "Domain partition"},
                "agent_type": {"type": "string", "enum": ["desktop", "code", "api", "unknown"]},
                "access_scope": {"type": "string", "enum": ["session", "shared", "global"], "default": "session"},
                "slug": {"type": "string", "description": "Optional unique slug"}
            },
            "required": ["content"]
        }"#,
    ),
    (
        "search",
        "Search memories by keyword, semantic similarity, or both",
        r#"{
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "mode": {"type": "string", "enum": ["keyword", "semantic", "hybrid"], "default": "hybrid"},
                "limit": {"type": "integer", "minimum": 1, "maximum": 100, "default": 10},
                "offset": {"type": "integer", "minimum": 0, "default": 0},
                "session_id": {"type": "string"},
                "domain": {"type": "string"},
                "min_importance": {"type": "integer", "minimum": 1, "maximum": 10},
                "created_after": {"type": "string", "format": "date-time"},
                "created_before": {"type": "string", "format": "date-time"},
                "tags": {"type": "array", "items": {"type": "string"}, "description": "Results must carry every listed tag"}
            },
            "required": ["query"]
        }"#,
    ),
    (
        "get_memory",
        "Retrieve a memory by id",
        r#"{
            "type": "object",
            "properties": {
                "id": {"type": "integer"},
                "track_access": {"type": "boolean", "default": true}
            },
            "required": ["id"]
        }"#,
    ),
    (
        "update_memory",
        "Update an existing memory; only supplied fields change",
        r#"{
            "type": "object",
            "properties": {
                "id": {"type": "integer"},
                "content": {"type": "string"},
                "source": {"type": "string"},
                "importance": {"type": "integer", "minimum": 1, "maximum": 10},
                "tags": {"type": "array", "items": {"type": "string"}},
                "domain": {"type": "string"},
                "access_scope": {"type": "string", "enum": ["session", "shared", "global"]},
                "slug": {"type": "string"}
            },
            "required": ["id"]
        }"#,
    ),
    (
        "delete_memory",
        "Delete a memory; relationships and chunks cascade",
        r#"{
            "type": "object",
            "properties": {
                "id": {"type": "integer"}
            },
            "required": ["id"]
        }"#,
    ),
    (
        "relate",
        "Create a typed relationship between two memories",
        r#"{
            "type": "object",
            "properties": {
                "source_memory_id": {"type": "integer"},
                "target_memory_id": {"type": "integer"},
                "relationship_type": {"type": "string", "enum": ["references", "contradicts", "expands", "similar", "sequential", "causes", "enables"], "default": "references"},
                "strength": {"type": "number", "minimum": 0, "maximum": 1},
                "context": {"type": "string", "description": "Why this relationship exists"}
            },
            "required": ["source_memory_id", "target_memory_id"]
        }"#,
    ),
    (
        "find_related",
        "List relationships touching a memory, in either direction",
        r#"{
            "type": "object",
            "properties": {
                "id": {"type": "integer"}
            },
            "required": ["id"]
        }"#,
    ),
    (
        "map_graph",
        "Traverse the relationship graph from a root memory",
        r#"{
            "type": "object",
            "properties": {
                "root_id": {"type": "integer"},
                "max_depth": {"type": "integer", "minimum": 1, "maximum": 10, "default": 3}
            },
            "required": ["root_id"]
        }"#,
    ),
    (
        "analyze",
        "Ask the chat provider a question over the most relevant memories",
        r#"{
            "type": "object",
            "properties": {
                "question": {"type": "string"},
                "session_id": {"type": "string", "description": "Restrict context to one session"}
            },
            "required": ["question"]
        }"#,
    ),
    (
        "list_categories",
        "List all categories",
        r#"{"type": "object", "properties": {}}"#,
    ),
    (
        "list_domains",
        "List all domains",
        r#"{"type": "object", "properties": {}}"#,
    ),
    (
        "list_sessions",
        "List known agent sessions, most recent first",
        r#"{
            "type": "object",
            "properties": {
                "limit": {"type": "integer", "minimum": 1, "maximum": 100, "default": 20}
            }
        }"#,
    ),
];

/// All tool definitions with parsed schemas
pub fn tool_definitions() -> Vec<ToolDefinition> {
    TOOL_DEFINITIONS
        .iter()
        .map(|(name, description, schema)| ToolDefinition {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: serde_json::from_str(schema).unwrap_or_else(|_| json!({})),
        })
        .collect()
}

/// Routes tool calls onto the core services
pub struct ToolRouter {
    pub storage: Storage,
    pub memory: Arc<MemoryService>,
    pub search: Arc<SearchEngine>,
    pub graph: Arc<GraphService>,
    pub ingest: Arc<IngestService>,
    pub ai: Arc<AiManager>,
    runtime: tokio::runtime::Handle,
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    mode: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
    session_id: Option<String>,
    domain: Option<String>,
    min_importance: Option<i32>,
    created_after: Option<chrono::DateTime<chrono::Utc>>,
    created_before: Option<chrono::DateTime<chrono::Utc>>,
    tags: Option<Vec<String>>,
}

impl ToolRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Storage,
        memory: Arc<MemoryService>,
        search: Arc<SearchEngine>,
        graph: Arc<GraphService>,
        ingest: Arc<IngestService>,
        ai: Arc<AiManager>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            storage,
            memory,
            search,
            graph,
            ingest,
            ai,
            runtime,
        }
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value> {
        let cancel = CancellationToken::new();
        match name {
            "store_memory" => {
                let input: CreateMemoryInput = serde_json::from_value(args)?;
                let memory = self.memory.store(&input)?;
                Arc::clone(&self.ai).spawn_embed(
                    self.storage.clone(),
                    memory.id,
                    memory.content.clone(),
                );
                Ok(serde_json::to_value(&memory)?)
            }
            "search" => {
                let args: SearchArgs = serde_json::from_value(args)?;
                let mode = match args.mode.as_deref() {
                    None | Some("hybrid") => SearchMode::Hybrid,
                    Some("keyword") => SearchMode::Keyword,
                    Some("semantic") => SearchMode::Semantic,
                    Some(other) => {
                        return Err(MycelicError::invalid(
                            "mode",
                            format!("unknown search mode: {}", other),
                        ))
                    }
                };
                let options = SearchOptions {
                    mode,
                    limit: args.limit,
                    offset: args.offset,
                    min_relevance: None,
                    filters: SearchFilters {
                        session_id: args.session_id,
                        domain: args.domain,
                        min_importance: args.min_importance,
                        created_after: args.created_after,
                        created_before: args.created_before,
                        tags: args.tags,
                    },
                };
                let response = self.search.search(&args.query, &options, &cancel).await?;
                Ok(serde_json::to_value(&response)?)
            }
            "get_memory" => {
                let id = require_i64(&args, "id")?;
                let track = args
                    .get("track_access")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let memory = self.memory.get(id, track)?;
                Ok(serde_json::to_value(&memory)?)
            }
            "update_memory" => {
                let id = require_i64(&args, "id")?;
                let input: UpdateMemoryInput = serde_json::from_value(args)?;
                let memory = self.memory.update(id, &input)?;
                if input.content.is_some() {
                    Arc::clone(&self.ai).spawn_embed(
                        self.storage.clone(),
                        memory.id,
                        memory.content.clone(),
                    );
                }
                Ok(serde_json::to_value(&memory)?)
            }
            "delete_memory" => {
                let id = require_i64(&args, "id")?;
                self.memory.delete(id)?;
                let ai = Arc::clone(&self.ai);
                tokio::spawn(async move {
                    if let Err(e) = ai.delete_vectors(&[id]).await {
                        tracing::warn!(id, "vector cleanup failed: {}", e);
                    }
                });
                Ok(json!({ "deleted": id }))
            }
            "relate" => {
                let input: CreateRelationshipInput = serde_json::from_value(args)?;
                let relationship = self.graph.relate(&input)?;
                Ok(serde_json::to_value(&relationship)?)
            }
            "find_related" => {
                let id = require_i64(&args, "id")?;
                let relationships = self.graph.find_related(id)?;
                Ok(serde_json::to_value(&relationships)?)
            }
            "map_graph" => {
                let root_id = require_i64(&args, "root_id")?;
                let max_depth = args
                    .get("max_depth")
                    .and_then(Value::as_i64)
                    .unwrap_or(3) as i32;
                let graph = self.graph.map_graph(root_id, max_depth, &cancel).await?;
                Ok(serde_json::to_value(&graph)?)
            }
            "analyze" => {
                let question = args
                    .get("question")
                    .and_then(Value::as_str)
                    .ok_or_else(|| MycelicError::invalid("question", "required"))?;
                let session_id = args.get("session_id").and_then(Value::as_str);
                let reply =
                    analyze::analyze(&self.ai, &self.search, question, session_id, &cancel)
                        .await?;
                Ok(json!({ "analysis": reply }))
            }
            "list_categories" => {
                let categories = self.storage.with_reader(taxonomy::list_categories)?;
                Ok(serde_json::to_value(&categories)?)
            }
            "list_domains" => {
                let domains = self.storage.with_reader(taxonomy::list_domains)?;
                Ok(serde_json::to_value(&domains)?)
            }
            "list_sessions" => {
                let limit = args.get("limit").and_then(Value::as_i64).unwrap_or(20);
                let sessions = self
                    .storage
                    .with_reader(|conn| sessions::list_sessions(conn, limit))?;
                Ok(serde_json::to_value(&sessions)?)
            }
            other => Err(MycelicError::invalid(
                "tool",
                format!("unknown tool: {}", other),
            )),
        }
    }

    fn dispatch_call(&self, params: &Value) -> Result<ToolCallResult> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| MycelicError::invalid("name", "tool name required"))?
            .to_string();
        let args = params.get("arguments").cloned().unwrap_or(json!({}));

        // The stdio loop runs on a blocking thread, so driving the async
        // call with the runtime handle is safe here.
        let result = self.runtime.block_on(async {
            match tokio::time::timeout(TOOL_TIMEOUT, self.call_tool(&name, args)).await {
                Ok(result) => result,
                Err(_) => Err(MycelicError::Timeout(format!(
                    "tool {} exceeded {:?}",
                    name, TOOL_TIMEOUT
                ))),
            }
        })?;

        Ok(ToolCallResult::json(&result))
    }
}

fn require_i64(args: &Value, field: &'static str) -> Result<i64> {
    args.get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| MycelicError::invalid(field, "required integer"))
}

impl McpHandler for ToolRouter {
    fn handle_request(&self, request: McpRequest) -> McpResponse {
        match request.method.as_str() {
            methods::INITIALIZE => McpResponse::success(
                request.id,
                serde_json::to_value(InitializeResult::default()).unwrap_or_default(),
            ),
            methods::LIST_TOOLS => McpResponse::success(
                request.id,
                json!({ "tools": tool_definitions() }),
            ),
            methods::CALL_TOOL => match self.dispatch_call(&request.params) {
                Ok(result) => McpResponse::success(
                    request.id,
                    serde_json::to_value(result).unwrap_or_default(),
                ),
                Err(e) => {
                    tracing::warn!("tool call failed: {}", e);
                    McpResponse::from_error(request.id, &e)
                }
            },
            other => McpResponse::error(
                request.id,
                -32601,
                format!("Method not found: {}", other),
            ),
        }
    }
}
