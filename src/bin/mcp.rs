//! MycelicMemory MCP server
//!
//! JSON-RPC 2.0 over stdin/stdout. Logs go to stderr so stdout stays a
//! clean protocol stream.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use mycelic::api::AppState;
use mycelic::mcp::{McpServer, ToolRouter};
use mycelic::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    let state = AppState::from_config(&config)?;
    mycelic::ai::EmbeddingCache::spawn_pruner(state.ai.cache().clone());

    tracing::info!(
        db = %config.db_path().display(),
        "mycelic MCP server ready"
    );

    let router = ToolRouter::new(
        state.storage.clone(),
        state.memory.clone(),
        state.search.clone(),
        state.graph.clone(),
        state.ingest.clone(),
        state.ai.clone(),
        tokio::runtime::Handle::current(),
    );

    let server = McpServer::new(router);
    tokio::task::spawn_blocking(move || server.run()).await??;

    Ok(())
}
