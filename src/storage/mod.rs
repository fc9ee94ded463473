//! Storage engine: embedded SQLite, schema, migrations, FTS maintenance

pub mod connection;
pub mod graph_queries;
pub mod metrics;
pub mod migrations;
pub mod queries;
pub mod sessions;
pub mod sources;
pub mod taxonomy;

pub use connection::{ReaderHandle, Storage};
pub use migrations::SCHEMA_VERSION;
