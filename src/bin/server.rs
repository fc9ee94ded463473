//! MycelicMemory REST server
//!
//! Serves the /api/v1 surface on the configured port.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mycelic::api::{self, AppState};
use mycelic::Config;

#[derive(Parser)]
#[command(name = "mycelic-server")]
#[command(about = "MycelicMemory REST API server")]
#[command(version)]
struct Args {
    /// Listen port (overrides MYCELIC_HTTP_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let state = AppState::from_config(&config)?;
    mycelic::ai::EmbeddingCache::spawn_pruner(state.ai.cache().clone());

    let port = args.port.unwrap_or(config.http_port);
    let app = api::router(state, &config.cors_origins);

    let addr = format!("{}:{}", args.host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "mycelic REST server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}
