//! MCP (Model Context Protocol) client implementation.
//!
//! Connects to external MCP servers and exposes their tools to the chat loop.

pub mod client;
pub mod transport;
pub mod types;
pub mod wrapper;

pub use client::McpServerManager;
pub use transport::{HttpTransport, McpTransport, StdioTransport};
pub use types::{ConnectionStatus, McpContent, McpToolDef, McpToolResult};
pub use wrapper::{wrap_all_tools, McpToolWrapper};
