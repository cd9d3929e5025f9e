//! Shared conversation types for chat backends

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tool invocations requested by the assistant (empty for other roles)
    pub tool_calls: Vec<ToolCall>,
    /// Name of the tool a `tool`-role message answers
    pub tool_name: Option<String>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant turn that asks for one or more tools
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    pub fn tool_result(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A tool call from the model
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Definition of a tool advertised to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the accepted arguments
    pub parameters: serde_json::Value,
}

/// Bookkeeping a backend attaches to a finished completion
#[derive(Debug, Clone, Default)]
pub struct CompletionMetadata {
    pub done_reason: Option<String>,
    pub prompt_eval_count: Option<u32>,
    pub eval_count: Option<u32>,
    pub total_duration: Option<Duration>,
}

/// One assistant turn returned by a backend
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub message: Message,
    pub metadata: CompletionMetadata,
}

impl ChatReply {
    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.message.tool_calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_carries_tool_name() {
        let msg = Message::tool_result("weather", "22C clear");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_name.as_deref(), Some("weather"));
        assert!(!msg.has_tool_calls());
    }

    #[test]
    fn assistant_tool_calls_are_kept_in_order() {
        let msg = Message::assistant_tool_calls(
            "",
            vec![
                ToolCall::new("a", serde_json::json!({})),
                ToolCall::new("b", serde_json::json!({"x": 1})),
            ],
        );
        assert!(msg.has_tool_calls());
        let names: Vec<_> = msg.tool_calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Tool).unwrap(), "\"tool\"");
        assert_eq!(Role::Assistant.as_str(), "assistant");
    }
}
