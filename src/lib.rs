//! llm-relay: chat with a pool of Ollama servers, with tools
//!
//! This library provides:
//! - A backend pool that leases one idle, live server per conversation
//! - A bounded tool-calling chat loop with progress reporting
//! - Prompt templates rendered from caller context
//! - MCP clients (stdio and HTTP) that supply the tools

pub mod agent;
pub mod config;
pub mod llm;
pub mod mcp;
pub mod pool;
pub mod templates;
pub mod tools;
pub mod transport;

pub use agent::{Assistant, ChatError};
pub use config::Config;
