//! REST front-end: axum router under /api/v1

pub mod handlers;

use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::ai::AiManager;
use crate::graph::GraphService;
use crate::ingest::IngestService;
use crate::memory::MemoryService;
use crate::search::SearchEngine;
use crate::storage::Storage;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub memory: Arc<MemoryService>,
    pub search: Arc<SearchEngine>,
    pub graph: Arc<GraphService>,
    pub ingest: Arc<IngestService>,
    pub ai: Arc<AiManager>,
}

impl AppState {
    /// Wire every service from configuration. Shared by all three
    /// front-end binaries.
    pub fn from_config(config: &crate::config::Config) -> crate::error::Result<Self> {
        config.ensure_data_dir()?;
        let storage = Storage::open(config.db_path())?;
        let ai = Arc::new(AiManager::from_config(config)?);

        let memory = Arc::new(MemoryService::new(
            storage.clone(),
            Arc::new(crate::memory::ProcessSessionResolver::new()),
            config.session_hint.clone(),
            config.chunk_threshold_tokens,
        ));
        let search = Arc::new(SearchEngine::new(
            storage.clone(),
            Some(ai.clone()),
            crate::search::SearchConfig {
                bm25_divisor: config.bm25_divisor,
                ..Default::default()
            },
        ));
        let graph = Arc::new(GraphService::new(storage.clone()));
        let ingest = Arc::new(IngestService::new(storage.clone(), memory.clone()));

        Ok(Self {
            storage,
            memory,
            search,
            graph,
            ingest,
            ai,
        })
    }
}

/// Build the /api/v1 router
pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    let cors = if cors_origins.is_empty() {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers(Any)
    };

    let v1 = Router::new()
        .route("/health", get(handlers::health))
        .route("/memories", post(handlers::create_memory))
        .route("/memories", get(handlers::list_memories))
        .route("/memories/:id", get(handlers::get_memory))
        .route("/memories/:id", put(handlers::update_memory))
        .route("/memories/:id", delete(handlers::delete_memory))
        .route("/memories/:id/related", get(handlers::find_related))
        .route("/memories/:id/graph", get(handlers::map_graph))
        .route("/memories/:id/chunks", get(handlers::get_chunks))
        .route("/search", post(handlers::search))
        .route("/analyze", post(handlers::analyze))
        .route("/relationships", post(handlers::create_relationship))
        .route("/relationships/:id", delete(handlers::delete_relationship))
        .route("/categories", get(handlers::list_categories))
        .route("/domains", get(handlers::list_domains))
        .route("/sessions", get(handlers::list_sessions))
        .route("/sources", post(handlers::create_source))
        .route("/sources", get(handlers::list_sources))
        .route("/sources/:id/history", get(handlers::sync_history))
        .with_state(state);

    Router::new()
        .nest("/api/v1", v1)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
