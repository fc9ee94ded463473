//! Environment-driven configuration
//!
//! All knobs are read from `MYCELIC_*` environment variables with sensible
//! defaults; the data directory is created on first use.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MycelicError, Result};

/// Default HTTP port for the REST front-end
pub const DEFAULT_HTTP_PORT: u16 = 3217;

/// Top-level configuration assembled from the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for the database file and caches
    pub data_dir: PathBuf,
    /// Log level: debug, info, warn, error
    pub log_level: String,
    /// Embedding provider base URL (None = deterministic fallback embedder)
    pub embedding_url: Option<String>,
    /// Vector store base URL (None = semantic search degraded)
    pub vector_url: Option<String>,
    /// Embedding model name
    pub embedding_model: String,
    /// Chat provider base URL (None = analyze unavailable)
    pub chat_url: Option<String>,
    /// Chat model name
    pub chat_model: String,
    /// L1 embedding cache capacity (entries)
    pub l1_cache_capacity: usize,
    /// L1 embedding cache TTL
    pub l1_ttl: Duration,
    /// L2 embedding cache TTL
    pub l2_ttl: Duration,
    /// Rate limit hints passed through to middleware
    pub rate_limit_rps: u32,
    pub rate_limit_burst: u32,
    /// REST listen port
    pub http_port: u16,
    /// Allowed CORS origins
    pub cors_origins: Vec<String>,
    /// Session hint for the session resolver
    pub session_hint: Option<String>,
    /// BM25 relevance divisor
    pub bm25_divisor: f64,
    /// Token threshold above which content is chunked
    pub chunk_threshold_tokens: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            embedding_url: None,
            vector_url: None,
            embedding_model: "nomic-embed-text".to_string(),
            chat_url: None,
            chat_model: "llama3.1".to_string(),
            l1_cache_capacity: 2048,
            l1_ttl: Duration::from_secs(3600),
            l2_ttl: Duration::from_secs(86_400),
            rate_limit_rps: 20,
            rate_limit_burst: 40,
            http_port: DEFAULT_HTTP_PORT,
            cors_origins: vec![],
            session_hint: None,
            bm25_divisor: 10.0,
            chunk_threshold_tokens: 400,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".mycelic"))
        .unwrap_or_else(|| PathBuf::from(".mycelic"))
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Assemble configuration from the environment
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(dir) = env_var("MYCELIC_DATA_DIR") {
            let expanded = shellexpand::tilde(&dir);
            config.data_dir = PathBuf::from(expanded.as_ref());
        }

        if let Some(level) = env_var("MYCELIC_LOG_LEVEL") {
            let level = level.to_lowercase();
            if !matches!(level.as_str(), "debug" | "info" | "warn" | "error") {
                return Err(MycelicError::Config(format!(
                    "invalid MYCELIC_LOG_LEVEL: {}",
                    level
                )));
            }
            config.log_level = level;
        }

        config.embedding_url = env_var("MYCELIC_EMBEDDING_URL");
        config.vector_url = env_var("MYCELIC_VECTOR_URL");
        config.chat_url = env_var("MYCELIC_CHAT_URL");

        if let Some(model) = env_var("MYCELIC_EMBEDDING_MODEL") {
            config.embedding_model = model;
        }
        if let Some(model) = env_var("MYCELIC_CHAT_MODEL") {
            config.chat_model = model;
        }

        if let Some(v) = env_var("MYCELIC_L1_CACHE_CAPACITY") {
            config.l1_cache_capacity = parse_num(&v, "MYCELIC_L1_CACHE_CAPACITY")?;
        }
        if let Some(v) = env_var("MYCELIC_L1_TTL_SECS") {
            config.l1_ttl = Duration::from_secs(parse_num(&v, "MYCELIC_L1_TTL_SECS")?);
        }
        if let Some(v) = env_var("MYCELIC_L2_TTL_SECS") {
            config.l2_ttl = Duration::from_secs(parse_num(&v, "MYCELIC_L2_TTL_SECS")?);
        }
        if let Some(v) = env_var("MYCELIC_RATE_LIMIT_RPS") {
            config.rate_limit_rps = parse_num(&v, "MYCELIC_RATE_LIMIT_RPS")?;
        }
        if let Some(v) = env_var("MYCELIC_RATE_LIMIT_BURST") {
            config.rate_limit_burst = parse_num(&v, "MYCELIC_RATE_LIMIT_BURST")?;
        }
        if let Some(v) = env_var("MYCELIC_HTTP_PORT") {
            config.http_port = parse_num(&v, "MYCELIC_HTTP_PORT")?;
        }
        if let Some(v) = env_var("MYCELIC_CORS_ORIGINS") {
            config.cors_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        config.session_hint = env_var("MYCELIC_SESSION_ID");

        if let Some(v) = env_var("MYCELIC_BM25_DIVISOR") {
            let divisor: f64 = v
                .parse()
                .map_err(|_| MycelicError::Config(format!("invalid MYCELIC_BM25_DIVISOR: {}", v)))?;
            if divisor <= 0.0 {
                return Err(MycelicError::Config(
                    "MYCELIC_BM25_DIVISOR must be positive".to_string(),
                ));
            }
            config.bm25_divisor = divisor;
        }
        if let Some(v) = env_var("MYCELIC_CHUNK_THRESHOLD_TOKENS") {
            config.chunk_threshold_tokens = parse_num(&v, "MYCELIC_CHUNK_THRESHOLD_TOKENS")?;
        }

        Ok(config)
    }

    /// Path to the main database file
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("mycelic.db")
    }

    /// Path to the L2 embedding cache companion file
    pub fn embedding_cache_path(&self) -> PathBuf {
        self.data_dir.join("embedding_cache.db")
    }

    /// Ensure the data directory exists
    pub fn ensure_data_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(value: &str, key: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| MycelicError::Config(format!("invalid {}: {}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(config.bm25_divisor, 10.0);
        assert_eq!(config.chunk_threshold_tokens, 400);
        assert!(config.embedding_url.is_none());
    }

    #[test]
    fn test_db_paths() {
        let config = Config {
            data_dir: PathBuf::from("/tmp/mycelic-test"),
            ..Default::default()
        };
        assert_eq!(config.db_path(), PathBuf::from("/tmp/mycelic-test/mycelic.db"));
        assert_eq!(
            config.embedding_cache_path(),
            PathBuf::from("/tmp/mycelic-test/embedding_cache.db")
        );
    }
}
