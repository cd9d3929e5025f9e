//! Tools the model can call
//!
//! Providers (MCP servers, in-process tools) register [`Tool`] objects with the
//! [`ToolRegistry`]. Each chat invocation takes a [`ToolCatalog`] snapshot so the
//! set of tools cannot shift underneath a running conversation.

use crate::llm::ToolDefinition;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::timeout;

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Trait for callable tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name
    fn name(&self) -> &str;

    /// Get the tool description
    fn description(&self) -> &str;

    /// Get the JSON schema for parameters
    fn parameters(&self) -> Value;

    /// Run the tool; each returned string is one line of output
    async fn call(&self, arguments: Value) -> anyhow::Result<Vec<String>>;

    /// Convert to LLM tool definition
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool '{0}' not found")]
    NotFound(String),

    #[error("{0}")]
    Failed(String),

    #[error("Tool '{name}' timed out after {} seconds", .after.as_secs())]
    TimedOut { name: String, after: Duration },

    #[error("Tool '{name}' crashed: {message}")]
    Panicked { name: String, message: String },
}

/// Live registry of tools, shared across invocations
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, Arc<dyn Tool>>>,
    tool_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(BTreeMap::new()),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_tool_timeout(mut self, tool_timeout: Duration) -> Self {
        self.tool_timeout = tool_timeout;
        self
    }

    /// Register a tool, replacing any tool of the same name
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.write().await.insert(name.clone(), tool).is_some() {
            tracing::warn!("Tool '{}' registered twice, keeping the latest", name);
        }
    }

    pub async fn register_all(&self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) {
        for tool in tools {
            self.register(tool).await;
        }
    }

    pub async fn list_tools(&self) -> Vec<ToolDefinition> {
        self.tools
            .read()
            .await
            .values()
            .map(|tool| tool.to_definition())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }

    /// Freeze the current tool set for one invocation
    pub async fn snapshot(&self) -> ToolCatalog {
        let tools = self.tools.read().await.clone();
        ToolCatalog::new(tools.into_values(), self.tool_timeout)
    }

    pub async fn call(&self, name: &str, arguments: Value) -> Result<Vec<String>, ToolError> {
        self.snapshot().await.call(name, arguments).await
    }
}

/// Immutable view of the tools available to one conversation
#[derive(Clone)]
pub struct ToolCatalog {
    tools: Arc<HashMap<String, Arc<dyn Tool>>>,
    definitions: Arc<Vec<ToolDefinition>>,
    tool_timeout: Duration,
}

impl ToolCatalog {
    pub fn new(tools: impl IntoIterator<Item = Arc<dyn Tool>>, tool_timeout: Duration) -> Self {
        let tools: HashMap<String, Arc<dyn Tool>> = tools
            .into_iter()
            .map(|tool| (tool.name().to_string(), tool))
            .collect();
        let mut definitions: Vec<ToolDefinition> =
            tools.values().map(|tool| tool.to_definition()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            tools: Arc::new(tools),
            definitions: Arc::new(definitions),
            tool_timeout,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), DEFAULT_TOOL_TIMEOUT)
    }

    /// Definitions advertised on every model request, sorted by name
    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Call a tool by name with timeout and panic recovery
    pub async fn call(&self, name: &str, arguments: Value) -> Result<Vec<String>, ToolError> {
        let Some(tool) = self.tools.get(name) else {
            return Err(ToolError::NotFound(name.to_string()));
        };

        match timeout(
            self.tool_timeout,
            AssertUnwindSafe(tool.call(arguments)).catch_unwind(),
        )
        .await
        {
            Ok(Ok(Ok(lines))) => Ok(lines),
            Ok(Ok(Err(e))) => Err(ToolError::Failed(format!("{:#}", e))),
            Ok(Err(panic_info)) => {
                let message = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                tracing::error!("Tool '{}' panicked: {}", name, message);
                Err(ToolError::Panicked {
                    name: name.to_string(),
                    message,
                })
            }
            Err(_) => Err(ToolError::TimedOut {
                name: name.to_string(),
                after: self.tool_timeout,
            }),
        }
    }
}

/// Display-name overrides for status updates
#[derive(Debug, Clone, Default)]
pub struct ToolNames {
    overrides: HashMap<String, String>,
}

impl ToolNames {
    pub fn new(overrides: HashMap<String, String>) -> Self {
        Self { overrides }
    }

    /// The configured display text, or the raw tool name
    pub fn display<'a>(&'a self, name: &'a str) -> &'a str {
        self.overrides.get(name).map(String::as_str).unwrap_or(name)
    }
}
