//! Ollama backend client (`/api/show` liveness probe and `/api/chat`)

use super::{
    ChatBackend, ChatReply, CompletionMetadata, LlmError, Message, Role, ToolCall, ToolDefinition,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// HTTP client shared by every backend in the pool
///
/// Retries are never attempted here: a failed probe moves the pool on to the
/// next server and a failed chat call ends the invocation.
#[derive(Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
}

/// Model details reported by `/api/show`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelDetails {
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub parameter_size: String,
    #[serde(default)]
    pub quantization_level: String,
}

impl OllamaClient {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// Ask a server whether it is serving `model`
    pub async fn show(&self, base_url: &str, model: &str) -> Result<ModelDetails, LlmError> {
        let url = endpoint(base_url, "/api/show");
        let response = self
            .client
            .post(&url)
            .json(&ShowRequest { model })
            .send()
            .await
            .map_err(LlmError::from_network_error)?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_http_status(status, error_text));
        }

        // Details are informational; an odd body still counts as alive.
        let body = response.text().await.unwrap_or_default();
        let details = serde_json::from_str::<ShowResponse>(&body)
            .map(|r| r.details)
            .unwrap_or_default();
        Ok(details)
    }

    fn convert_messages(messages: &[Message]) -> Vec<OllamaMessage> {
        messages
            .iter()
            .map(|msg| OllamaMessage {
                role: msg.role.as_str().to_string(),
                content: msg.content.clone(),
                tool_calls: if msg.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        msg.tool_calls
                            .iter()
                            .map(|tc| OllamaToolCall {
                                function: OllamaToolCallFunction {
                                    index: None,
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_name: msg.tool_name.clone(),
            })
            .collect()
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Vec<OllamaTool<'_>> {
        tools
            .iter()
            .map(|t| OllamaTool {
                type_field: "function",
                function: OllamaFunction {
                    name: &t.name,
                    description: &t.description,
                    parameters: &t.parameters,
                },
            })
            .collect()
    }

    fn convert_reply(response: OllamaChatResponse) -> Result<ChatReply, LlmError> {
        let role = match response.message.role.as_str() {
            "" | "assistant" => Role::Assistant,
            other => {
                return Err(LlmError::InvalidResponse(format!(
                    "expected assistant message, got role '{}'",
                    other
                )))
            }
        };

        let tool_calls = response
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                name: tc.function.name,
                arguments: normalize_arguments(tc.function.arguments),
            })
            .collect();

        Ok(ChatReply {
            message: Message {
                role,
                content: response.message.content,
                tool_calls,
                tool_name: None,
            },
            metadata: CompletionMetadata {
                done_reason: response.done_reason,
                prompt_eval_count: response.prompt_eval_count,
                eval_count: response.eval_count,
                total_duration: response.total_duration.map(Duration::from_nanos),
            },
        })
    }
}

#[async_trait]
impl ChatBackend for OllamaClient {
    async fn probe(&self, base_url: &str, model: &str) -> Result<(), LlmError> {
        let details = self.show(base_url, model).await?;
        tracing::debug!(
            backend = %base_url,
            family = %details.family,
            parameter_size = %details.parameter_size,
            quantization = %details.quantization_level,
            "Backend is serving {}",
            model
        );
        Ok(())
    }

    async fn chat(
        &self,
        base_url: &str,
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChatReply, LlmError> {
        let request = OllamaChatRequest {
            model,
            messages: Self::convert_messages(messages),
            tools: Self::convert_tools(tools),
            stream: false,
        };

        let url = endpoint(base_url, "/api/chat");
        tracing::debug!(
            backend = %base_url,
            messages = messages.len(),
            tools = tools.len(),
            "Sending chat request"
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Ollama call error: {}", e);
                LlmError::from_network_error(e)
            })?;

        let status = response.status();
        let body = response.text().await.map_err(LlmError::from_network_error)?;
        if status != reqwest::StatusCode::OK {
            tracing::error!(status = %status, body = %body, "Ollama call returned non-200 status");
            return Err(LlmError::from_http_status(status, body));
        }

        let parsed: OllamaChatResponse = serde_json::from_str(&body).map_err(|e| {
            tracing::error!(error = %e, response = %body, "Unable to parse response");
            LlmError::InvalidResponse(format!("failed to parse response body: {}", e))
        })?;

        tracing::debug!(
            model = %parsed.model,
            created_at = ?parsed.created_at,
            done = parsed.done,
            done_reason = ?parsed.done_reason,
            eval_count = ?parsed.eval_count,
            "Chat response received"
        );

        Self::convert_reply(parsed)
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// Some models send arguments as a JSON-encoded string instead of an object.
fn normalize_arguments(arguments: Value) -> Value {
    match arguments {
        Value::Null => Value::Object(Default::default()),
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(parsed @ Value::Object(_)) => parsed,
            _ => Value::String(raw),
        },
        other => other,
    }
}

/// Return the answer that follows the model's last reasoning block.
///
/// Reasoning models wrap their scratch work in `<think>...</think>` (or
/// `<thinking>...</thinking>`); only the text after the final closing tag is
/// meant for the reader.
pub fn strip_thinking(text: &str) -> &str {
    let think = text.rfind("</think>").map(|i| i + "</think>".len());
    let thinking = text.rfind("</thinking>").map(|i| i + "</thinking>".len());
    let start = match (think, thinking) {
        (Some(a), Some(b)) => a.max(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => 0,
    };
    text[start..].trim()
}

// Ollama API types

#[derive(Debug, Serialize)]
struct ShowRequest<'a> {
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct ShowResponse {
    #[serde(default)]
    details: ModelDetails,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OllamaTool<'a>>,
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct OllamaTool<'a> {
    #[serde(rename = "type")]
    type_field: &'static str,
    function: OllamaFunction<'a>,
}

#[derive(Debug, Serialize)]
struct OllamaFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaToolCall {
    function: OllamaToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaToolCallFunction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    index: Option<u32>,
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    message: OllamaMessage,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    done: bool,
    /// Nanoseconds
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}
