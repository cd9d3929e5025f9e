//! Adapts remote MCP tools to the local [`Tool`] trait.

use super::client::McpServerManager;
use super::types::McpToolDef;
use crate::tools::Tool;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Wraps an MCP tool to implement the Tool trait
pub struct McpToolWrapper {
    /// Server ID this tool belongs to
    server_id: String,
    tool_def: McpToolDef,
    manager: Arc<McpServerManager>,
}

impl McpToolWrapper {
    pub fn new(server_id: String, tool_def: McpToolDef, manager: Arc<McpServerManager>) -> Self {
        Self {
            server_id,
            tool_def,
            manager,
        }
    }
}

#[async_trait]
impl Tool for McpToolWrapper {
    fn name(&self) -> &str {
        &self.tool_def.name
    }

    fn description(&self) -> &str {
        &self.tool_def.description
    }

    fn parameters(&self) -> Value {
        self.tool_def.input_schema.clone()
    }

    async fn call(&self, arguments: Value) -> Result<Vec<String>> {
        let result = self
            .manager
            .call_tool(&self.server_id, &self.tool_def.name, arguments)
            .await
            .map_err(|e| {
                tracing::error!(
                    "Unable to call tool {} on {}: {:#}",
                    self.tool_def.name,
                    self.server_id,
                    e
                );
                e
            })?;

        if result.is_error {
            anyhow::bail!("{}", result.to_text());
        }
        Ok(result.to_lines())
    }
}

/// Wrap every tool of every connected server
///
/// When two servers publish the same tool name the later server wins.
pub async fn wrap_all_tools(manager: &Arc<McpServerManager>) -> Vec<Arc<dyn Tool>> {
    manager
        .all_tools()
        .await
        .into_iter()
        .map(|(server_id, tool_def)| {
            Arc::new(McpToolWrapper::new(server_id, tool_def, Arc::clone(manager))) as Arc<dyn Tool>
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn wrapper_exposes_remote_definition() {
        let manager = Arc::new(McpServerManager::new(Duration::from_secs(1)));
        let wrapper = McpToolWrapper::new(
            "weather".into(),
            McpToolDef {
                name: "get_weather_forecast".into(),
                description: "Forecast for a city".into(),
                input_schema: json!({"type": "object", "required": ["city"]}),
            },
            Arc::clone(&manager),
        );

        let def = wrapper.to_definition();
        assert_eq!(def.name, "get_weather_forecast");
        assert_eq!(def.parameters["required"][0], "city");

        // Not connected, so the call surfaces as a tool error
        let err = wrapper.call(json!({"city": "Paris"})).await.unwrap_err();
        assert!(err.to_string().contains("Unknown server"));
    }
}
