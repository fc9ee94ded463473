//! MCP front-end: JSON-RPC tools over stdin/stdout

pub mod protocol;
pub mod tools;

pub use protocol::{McpHandler, McpRequest, McpResponse, McpServer};
pub use tools::{tool_definitions, ToolRouter, TOOL_DEFINITIONS};
