use crate::llm::LlmError;
use crate::pool::PoolError;
use crate::templates::TemplateError;
use std::time::Duration;
use thiserror::Error;

/// Why a chat invocation produced no answer
///
/// Tool failures are absent on purpose: they are fed back to the model as
/// tool messages and never end the conversation.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Templates could not be loaded or rendered; retrying will not help
    #[error("configuration error: {0}")]
    Configuration(#[from] TemplateError),

    /// Every backend stayed busy or unreachable until the deadline
    #[error("no backend available after waiting {waited:?}")]
    NoBackendAvailable { waited: Duration },

    /// A model call failed on the wire, on status or while decoding
    #[error("backend call failed: {0}")]
    Backend(#[from] LlmError),

    /// The model kept asking for tools past the round ceiling
    #[error("maximum tool call depth exceeded ({rounds} rounds)")]
    ToolLoopExceeded { rounds: usize },

    /// The deadline passed while the model was working
    #[error("deadline exceeded while waiting for the model")]
    DeadlineExceeded,
}

impl From<PoolError> for ChatError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Timeout { waited } => ChatError::NoBackendAvailable { waited },
            PoolError::NoServers => ChatError::NoBackendAvailable {
                waited: Duration::ZERO,
            },
        }
    }
}

impl ChatError {
    /// Whether the caller may retry the whole invocation
    pub fn is_retryable(&self) -> bool {
        match self {
            ChatError::NoBackendAvailable { .. } | ChatError::DeadlineExceeded => true,
            ChatError::Backend(e) => e.is_retryable(),
            ChatError::Configuration(_) | ChatError::ToolLoopExceeded { .. } => false,
        }
    }
}
