//! MycelicMemory - persistent memory for AI agents
//!
//! Content-addressed storage of short text memories with tags, domains,
//! sessions, a typed relationship graph, keyword/semantic/hybrid search,
//! and AI-assisted analysis, exposed over MCP, REST, and a CLI.

pub mod ai;
pub mod api;
pub mod config;
pub mod error;
pub mod graph;
pub mod ingest;
pub mod mcp;
pub mod memory;
pub mod search;
pub mod storage;
pub mod types;

pub use config::Config;
pub use error::{ErrorCode, MycelicError, Result};
pub use storage::Storage;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
