//! Error types for MycelicMemory

use thiserror::Error;

/// Result type alias for Mycelic operations
pub type Result<T> = std::result::Result<T, MycelicError>;

/// User-visible error codes, stable across all three front-ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    InvalidInput,
    AlreadyExists,
    Unavailable,
    Timeout,
    RateLimited,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Main error type for Mycelic
#[derive(Error, Debug)]
pub enum MycelicError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error during {operation}: {message}")]
    Storage { operation: String, message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid input for {field}: {message}")]
    InvalidInput { field: &'static str, message: String },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Chat provider error: {0}")]
    Chat(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Ingest error for source {source_id}: {message}")]
    Ingest { source_id: i64, message: String },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Rate limited: retry after {0} seconds")]
    RateLimited(u64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Migration error at version {version}: {message}")]
    Migration { version: i32, message: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MycelicError {
    /// Shorthand for a memory-not-found error
    pub fn memory_not_found(id: i64) -> Self {
        MycelicError::NotFound {
            entity: "memory",
            id: id.to_string(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        MycelicError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        MycelicError::InvalidInput {
            field,
            message: message.into(),
        }
    }

    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        MycelicError::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Map to the user-visible error code taxonomy
    pub fn code(&self) -> ErrorCode {
        match self {
            MycelicError::NotFound { .. } => ErrorCode::NotFound,
            MycelicError::InvalidInput { .. } => ErrorCode::InvalidInput,
            MycelicError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            MycelicError::Unavailable(_)
            | MycelicError::Embedding(_)
            | MycelicError::VectorStore(_)
            | MycelicError::Chat(_)
            | MycelicError::Http(_) => ErrorCode::Unavailable,
            MycelicError::Timeout(_) => ErrorCode::Timeout,
            MycelicError::RateLimited(_) => ErrorCode::RateLimited,
            MycelicError::Database(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ErrorCode::AlreadyExists
            }
            _ => ErrorCode::InternalError,
        }
    }

    /// Check if error is transient and safe to retry
    pub fn is_retryable(&self) -> bool {
        match self {
            MycelicError::Http(_)
            | MycelicError::Unavailable(_)
            | MycelicError::RateLimited(_)
            | MycelicError::Timeout(_) => true,
            MycelicError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// JSON-RPC error code for the MCP front-end
    pub fn rpc_code(&self) -> i64 {
        match self.code() {
            ErrorCode::NotFound => -32001,
            ErrorCode::InvalidInput => -32602,
            ErrorCode::AlreadyExists => -32005,
            ErrorCode::Unavailable => -32002,
            ErrorCode::Timeout => -32008,
            ErrorCode::RateLimited => -32004,
            ErrorCode::InternalError => -32000,
        }
    }
}
