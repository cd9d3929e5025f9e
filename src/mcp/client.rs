//! MCP client for connecting to external tool servers.

use super::transport::{HttpTransport, McpTransport, StdioTransport};
use super::types::{ConnectionStatus, McpToolDef, McpToolResult, ServerCapabilities, ServerInfo};
use crate::config::McpServerConfig;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const PROTOCOL_VERSION: &str = "2024-11-05";

/// Information about a configured MCP server
pub struct McpServerConnection {
    pub config: McpServerConfig,
    pub status: ConnectionStatus,
    transport: Option<Arc<McpTransport>>,
    /// Discovered tools
    pub tools: Vec<McpToolDef>,
}

impl McpServerConnection {
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            status: ConnectionStatus::Disconnected,
            transport: None,
            tools: Vec::new(),
        }
    }
}

/// Manages connections to multiple MCP servers
pub struct McpServerManager {
    connections: RwLock<BTreeMap<String, McpServerConnection>>,
    request_timeout: Duration,
}

impl McpServerManager {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            connections: RwLock::new(BTreeMap::new()),
            request_timeout,
        }
    }

    /// Register the enabled servers from config
    pub async fn load_config(&self, servers: &BTreeMap<String, McpServerConfig>) {
        let mut connections = self.connections.write().await;
        for (id, server) in servers {
            if server.is_enabled() {
                connections.insert(id.clone(), McpServerConnection::new(server.clone()));
            }
        }
    }

    pub async fn server_ids(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    pub async fn status(&self, server_id: &str) -> Option<ConnectionStatus> {
        self.connections
            .read()
            .await
            .get(server_id)
            .map(|c| c.status.clone())
    }

    /// Connect every registered server; failures are logged and skipped
    pub async fn connect_all(&self) -> usize {
        let mut connected = 0;
        for id in self.server_ids().await {
            match self.connect(&id).await {
                Ok(()) => connected += 1,
                Err(e) => tracing::error!("Unable to initialize MCP server {}: {:#}", id, e),
            }
        }
        connected
    }

    /// Get all tools from all connected servers
    pub async fn all_tools(&self) -> Vec<(String, McpToolDef)> {
        let connections = self.connections.read().await;
        let mut tools = Vec::new();
        for (server_id, conn) in connections.iter() {
            if conn.status.is_connected() {
                for tool in &conn.tools {
                    tools.push((server_id.clone(), tool.clone()));
                }
            }
        }
        tools
    }

    /// Connect to a server, run the initialize handshake and list its tools
    pub async fn connect(&self, server_id: &str) -> Result<()> {
        let config = {
            let connections = self.connections.read().await;
            connections
                .get(server_id)
                .map(|c| c.config.clone())
                .ok_or_else(|| anyhow::anyhow!("Unknown server: {}", server_id))?
        };

        match self.handshake(&config).await {
            Ok((transport, info, tools)) => {
                tracing::info!(
                    "MCP server {} initialized ({} {}, {} tools)",
                    server_id,
                    info.name,
                    info.version,
                    tools.len()
                );
                let mut connections = self.connections.write().await;
                if let Some(conn) = connections.get_mut(server_id) {
                    conn.transport = Some(Arc::new(transport));
                    conn.tools = tools;
                    conn.status = ConnectionStatus::Connected;
                }
                Ok(())
            }
            Err(e) => {
                let mut connections = self.connections.write().await;
                if let Some(conn) = connections.get_mut(server_id) {
                    conn.status = ConnectionStatus::Failed(e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        config: &McpServerConfig,
    ) -> Result<(McpTransport, ServerInfo, Vec<McpToolDef>)> {
        let transport = match (&config.url, &config.command) {
            (Some(url), _) => McpTransport::Http(HttpTransport::new(url, self.request_timeout)?),
            (None, Some(command)) => McpTransport::Stdio(
                StdioTransport::spawn(command, &config.args, &config.env).await?,
            ),
            (None, None) => anyhow::bail!("MCP server needs `url` or `command`"),
        };

        let init = transport
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "llm-relay",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                })),
            )
            .await
            .context("initialize failed")?;
        if let Err(e) = transport.notify("notifications/initialized", None).await {
            tracing::debug!("initialized notification not accepted: {}", e);
        }

        let info: ServerInfo = init
            .get("serverInfo")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let capabilities: ServerCapabilities = init
            .get("capabilities")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let tools = if capabilities.tools.is_some() {
            match transport.request("tools/list", None).await {
                Ok(result) => parse_tool_list(&result),
                Err(e) => {
                    tracing::warn!("Unable to get tools: {}", e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Ok((transport, info, tools))
    }

    /// Call a tool on a server
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<McpToolResult> {
        // Clone the transport out so the lock is not held across the call
        let transport = {
            let connections = self.connections.read().await;
            let conn = connections
                .get(server_id)
                .ok_or_else(|| anyhow::anyhow!("Unknown server: {}", server_id))?;

            if !conn.status.is_connected() {
                return Err(anyhow::anyhow!("Server not connected: {}", server_id));
            }

            conn.transport
                .clone()
                .ok_or_else(|| anyhow::anyhow!("No transport for server: {}", server_id))?
        };

        let result = transport
            .request(
                "tools/call",
                Some(json!({
                    "name": tool_name,
                    "arguments": arguments
                })),
            )
            .await
            .with_context(|| format!("Failed to call tool: {}", tool_name))?;

        serde_json::from_value(result).context("Failed to parse tool result")
    }
}

/// Tools whose schema is not a JSON object are dropped with a warning
fn parse_tool_list(result: &Value) -> Vec<McpToolDef> {
    let Some(items) = result.get("tools").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<McpToolDef>(item.clone()) {
            Ok(def) if def.input_schema.is_object() => Some(def),
            Ok(def) => {
                tracing::warn!("Unable to get schema for tool {}: invalid schema", def.name);
                None
            }
            Err(e) => {
                tracing::warn!("Skipping malformed tool definition: {}", e);
                None
            }
        })
        .collect()
}
