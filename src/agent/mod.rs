//! Chat orchestration: conversation loop, status reporting and the entry point

mod chat;
mod context;
mod error;
mod orchestrator;
mod status;

pub use chat::Assistant;
pub use context::Conversation;
pub use error::ChatError;
pub use orchestrator::{ChatAnswer, ChatOrchestrator, DEFAULT_MAX_TOOL_ROUNDS};
pub use status::{
    status_processing_tools, status_thinking, StatusHistory, StatusReporter, StatusSink,
    STATUS_FINDING_SERVER, STATUS_FORMATTING, STATUS_PREPARING,
};
