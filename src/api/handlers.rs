//! REST handlers
//!
//! Error responses use the shape `{error: CODE, message, details?}`.
//! Internal details never cross the boundary; they go to the logs.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::AppState;
use crate::ai::analyze;
use crate::error::{ErrorCode, MycelicError};
use crate::search::total_pages;
use crate::storage::{sessions, taxonomy};
use crate::types::*;

/// Endpoint deadlines
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const AI_TIMEOUT: Duration = Duration::from_secs(60);

/// Error wrapper implementing the REST error shape
pub struct ApiError(pub MycelicError);

impl From<MycelicError> for ApiError {
    fn from(e: MycelicError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = match code {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorCode::AlreadyExists => StatusCode::CONFLICT,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Timeout => StatusCode::REQUEST_TIMEOUT,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Internal causes stay in the logs
        let message = if code == ErrorCode::InternalError {
            tracing::error!("internal error: {}", self.0);
            "internal error".to_string()
        } else {
            self.0.to_string()
        };

        let body = json!({ "error": code.as_str(), "message": message });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Pagination query parameters
#[derive(Debug, Deserialize)]
pub struct PageParams {
    page: Option<i64>,
    per_page: Option<i64>,
}

impl PageParams {
    /// Validate into (page, per_page, limit, offset)
    fn resolve(&self) -> ApiResult<(i64, i64, i64, i64)> {
        let page = self.page.unwrap_or(1);
        let per_page = self.per_page.unwrap_or(20);
        if page < 1 {
            return Err(MycelicError::invalid("page", "must be >= 1").into());
        }
        if !(1..=100).contains(&per_page) {
            return Err(MycelicError::invalid("per_page", "must be in 1..=100").into());
        }
        Ok((page, per_page, per_page, (page - 1) * per_page))
    }
}

#[derive(Debug, Serialize)]
pub struct PagedMemories {
    memories: Vec<Memory>,
    page: i64,
    per_page: i64,
    total: i64,
    total_pages: i64,
}

pub async fn health(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let stats = state.memory.stats()?;
    let ai_status = state.ai.get_status().await;
    let fts_ok = state.storage.verify_fts_integrity().unwrap_or(false);
    Ok(Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "fts_index_consistent": fts_ok,
        "ai": ai_status,
        "stats": stats,
    })))
}

pub async fn create_memory(
    State(state): State<AppState>,
    Json(input): Json<CreateMemoryInput>,
) -> ApiResult<(StatusCode, Json<Memory>)> {
    let memory = state.memory.store(&input)?;
    state
        .ai
        .clone()
        .spawn_embed(state.storage.clone(), memory.id, memory.content.clone());
    Ok((StatusCode::CREATED, Json(memory)))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    page: Option<i64>,
    per_page: Option<i64>,
    session_id: Option<String>,
    domain: Option<String>,
    min_importance: Option<i32>,
}

pub async fn list_memories(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<PagedMemories>> {
    let (page, per_page, limit, offset) = PageParams {
        page: params.page,
        per_page: params.per_page,
    }
    .resolve()?;
    let filters = SearchFilters {
        session_id: params.session_id,
        domain: params.domain,
        min_importance: params.min_importance,
        ..Default::default()
    };

    let total = state.memory.count(&filters)?;
    let memories = state.memory.list(&ListOptions {
        limit: Some(limit),
        offset: Some(offset),
        filters,
    })?;

    Ok(Json(PagedMemories {
        memories,
        page,
        per_page,
        total,
        total_pages: total_pages(total, per_page),
    }))
}

pub async fn get_memory(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Memory>> {
    Ok(Json(state.memory.get(id, true)?))
}

pub async fn update_memory(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(input): Json<UpdateMemoryInput>,
) -> ApiResult<Json<Memory>> {
    let memory = state.memory.update(id, &input)?;
    if input.content.is_some() {
        state
            .ai
            .clone()
            .spawn_embed(state.storage.clone(), memory.id, memory.content.clone());
    }
    Ok(Json(memory))
}

pub async fn delete_memory(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.memory.delete(id)?;
    let ai = state.ai.clone();
    tokio::spawn(async move {
        if let Err(e) = ai.delete_vectors(&[id]).await {
            tracing::warn!(id, "vector cleanup failed: {}", e);
        }
    });
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_chunks(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<Memory>>> {
    Ok(Json(state.memory.children(id)?))
}

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    query: String,
    #[serde(default)]
    mode: SearchMode,
    limit: Option<i64>,
    offset: Option<i64>,
    #[serde(default)]
    filters: SearchFilters,
}

pub async fn search(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> ApiResult<Json<SearchResponse>> {
    let options = SearchOptions {
        mode: body.mode,
        limit: body.limit,
        offset: body.offset,
        min_relevance: None,
        filters: body.filters,
    };
    let cancel = CancellationToken::new();
    let response = tokio::time::timeout(
        SEARCH_TIMEOUT,
        state.search.search(&body.query, &options, &cancel),
    )
    .await
    .map_err(|_| {
        cancel.cancel();
        MycelicError::Timeout("search exceeded 30s".to_string())
    })??;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeBody {
    question: String,
    session_id: Option<String>,
}

pub async fn analyze(
    State(state): State<AppState>,
    Json(body): Json<AnalyzeBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let cancel = CancellationToken::new();
    let reply = tokio::time::timeout(
        AI_TIMEOUT,
        analyze::analyze(
            &state.ai,
            &state.search,
            &body.question,
            body.session_id.as_deref(),
            &cancel,
        ),
    )
    .await
    .map_err(|_| {
        cancel.cancel();
        MycelicError::Timeout("analysis exceeded 60s".to_string())
    })??;
    Ok(Json(json!({ "analysis": reply })))
}

pub async fn create_relationship(
    State(state): State<AppState>,
    Json(input): Json<CreateRelationshipInput>,
) -> ApiResult<(StatusCode, Json<Relationship>)> {
    let relationship = state.graph.relate(&input)?;
    Ok((StatusCode::CREATED, Json(relationship)))
}

pub async fn delete_relationship(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.graph.unrelate(id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn find_related(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<Relationship>>> {
    Ok(Json(state.graph.find_related(id)?))
}

#[derive(Debug, Deserialize)]
pub struct GraphParams {
    max_depth: Option<i32>,
}

pub async fn map_graph(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<GraphParams>,
) -> ApiResult<Json<MemoryGraph>> {
    let cancel = CancellationToken::new();
    let graph = state
        .graph
        .map_graph(id, params.max_depth.unwrap_or(3), &cancel)
        .await?;
    Ok(Json(graph))
}

pub async fn list_categories(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<Category>>> {
    Ok(Json(state.storage.with_reader(taxonomy::list_categories)?))
}

pub async fn list_domains(State(state): State<AppState>) -> ApiResult<Json<Vec<Domain>>> {
    Ok(Json(state.storage.with_reader(taxonomy::list_domains)?))
}

#[derive(Debug, Deserialize)]
pub struct SessionParams {
    limit: Option<i64>,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
) -> ApiResult<Json<Vec<SessionRecord>>> {
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    Ok(Json(state.storage.with_reader(|conn| {
        sessions::list_sessions(conn, limit)
    })?))
}

#[derive(Debug, Deserialize)]
pub struct CreateSourceBody {
    source_type: String,
    name: String,
    #[serde(default)]
    config: HashMap<String, serde_json::Value>,
}

pub async fn create_source(
    State(state): State<AppState>,
    Json(body): Json<CreateSourceBody>,
) -> ApiResult<(StatusCode, Json<DataSource>)> {
    let source = state
        .ingest
        .register_source(&body.source_type, &body.name, &body.config)?;
    Ok((StatusCode::CREATED, Json(source)))
}

pub async fn list_sources(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<DataSource>>> {
    Ok(Json(state.ingest.list_sources()?))
}

pub async fn sync_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<SyncHistory>>> {
    Ok(Json(state.ingest.sync_history(id, 50)?))
}
