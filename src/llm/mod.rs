//! Chat backend abstraction and the Ollama implementation

mod error;
mod ollama;
mod types;

pub use error::LlmError;
pub use ollama::{strip_thinking, ModelDetails, OllamaClient};
pub use types::*;

use async_trait::async_trait;

/// A family of chat servers addressed by base URL
///
/// The pool probes through this trait and the orchestrator sends chat turns
/// through it, so tests can substitute a scripted backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Succeeds iff the server at `base_url` is up and serving `model`
    async fn probe(&self, base_url: &str, model: &str) -> Result<(), LlmError>;

    /// Send the full conversation plus tool catalog and return the assistant turn
    async fn chat(
        &self,
        base_url: &str,
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChatReply, LlmError>;
}
