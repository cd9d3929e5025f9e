//! MCP transport implementations.
//!
//! Supports:
//! - STDIO: spawn a child process and exchange newline-delimited JSON-RPC
//! - HTTP: POST JSON-RPC to `{url}/mcp`, answered with JSON or a short SSE stream

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

const SESSION_HEADER: &str = "Mcp-Session-Id";

static ENV_VAR_RE: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("valid env var regex"));

/// JSON-RPC request
#[derive(Debug, Clone, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
struct JsonRpcNotification {
    jsonrpc: &'static str,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

/// JSON-RPC response
#[derive(Debug, Clone, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<u64>,
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

impl JsonRpcResponse {
    fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(anyhow::anyhow!(
                "MCP error {}: {}",
                error.code,
                error.message
            ));
        }
        self.result
            .ok_or_else(|| anyhow::anyhow!("MCP response missing result"))
    }
}

/// Either transport, chosen by server config
pub enum McpTransport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

impl McpTransport {
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        match self {
            Self::Stdio(t) => t.request(method, params).await,
            Self::Http(t) => t.request(method, params).await,
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        match self {
            Self::Stdio(t) => t.notify(method, params).await,
            Self::Http(t) => t.notify(method, params).await,
        }
    }
}

/// STDIO transport for MCP servers
pub struct StdioTransport {
    /// Held so the server is killed when the transport is dropped
    _child: Child,
    next_id: AtomicU64,
    stdin: Arc<Mutex<tokio::process::ChildStdin>>,
    stdout: Arc<Mutex<BufReader<tokio::process::ChildStdout>>>,
}

impl StdioTransport {
    /// Spawn a new MCP server process
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // Set environment variables (expand ${VAR} references)
        for (key, value) in env {
            cmd.env(key, expand_env_vars(value));
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn MCP server: {}", command))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to get stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to get stdout"))?;

        Ok(Self {
            _child: child,
            next_id: AtomicU64::new(1),
            stdin: Arc::new(Mutex::new(stdin)),
            stdout: Arc::new(Mutex::new(BufReader::new(stdout))),
        })
    }

    /// Send a request and wait for the response with the same id
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        };
        let request_str = serde_json::to_string(&request)?;
        tracing::debug!("MCP request: {}", request_str);

        // Hold stdout across the write so concurrent callers cannot steal our reply
        let mut stdout = self.stdout.lock().await;
        self.write_line(&request_str).await?;

        loop {
            let mut line = String::new();
            if stdout.read_line(&mut line).await? == 0 {
                anyhow::bail!("MCP server closed stdout");
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            tracing::debug!("MCP response: {}", line);

            let Ok(response) = serde_json::from_str::<JsonRpcResponse>(line) else {
                tracing::debug!("Skipping non-response line from MCP server");
                continue;
            };
            if response.id == Some(id) {
                return response.into_result();
            }
        }
    }

    /// Send a notification (no response expected)
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
        };
        let notification_str = serde_json::to_string(&notification)?;
        tracing::debug!("MCP notification: {}", notification_str);
        self.write_line(&notification_str).await
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Streamable HTTP transport for MCP servers
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    next_id: AtomicU64,
    session_id: Mutex<Option<String>>,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build MCP HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/mcp", base_url.trim_end_matches('/')),
            next_id: AtomicU64::new(1),
            session_id: Mutex::new(None),
        })
    }

    async fn post<T: Serialize>(&self, body: &T) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = self.session_id.lock().await.as_deref() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach MCP server at {}", self.endpoint))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().await = Some(session.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("MCP server returned HTTP {}: {}", status, body);
        }
        Ok(response)
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        };
        tracing::debug!("MCP request to {}: {}", self.endpoint, method);

        let response = self.post(&request).await?;
        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let body = response
            .text()
            .await
            .context("Failed to read MCP response body")?;

        let response = if is_sse {
            find_sse_response(&body, id)?
        } else {
            serde_json::from_str(&body).context("Failed to parse MCP response")?
        };
        response.into_result()
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
        };
        self.post(&notification).await?;
        Ok(())
    }
}

/// Pick the response for `id` out of an SSE body
fn find_sse_response(body: &str, id: u64) -> Result<JsonRpcResponse> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<JsonRpcResponse>(data.trim()).ok())
        .find(|response| response.id == Some(id))
        .ok_or_else(|| anyhow::anyhow!("MCP event stream had no response for request {}", id))
}

/// Expand environment variable references like ${VAR} in a string
fn expand_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    for cap in ENV_VAR_RE.captures_iter(input) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("LLM_RELAY_TEST_VAR", "hello");
        assert_eq!(expand_env_vars("${LLM_RELAY_TEST_VAR} world"), "hello world");
        assert_eq!(expand_env_vars("no vars here"), "no vars here");
        assert_eq!(expand_env_vars("${NONEXISTENT_VAR_XYZ}"), "${NONEXISTENT_VAR_XYZ}");
    }

    #[test]
    fn sse_body_yields_matching_response() {
        let body = "event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"tools\":[]}}\n\n";
        let response = find_sse_response(body, 3).unwrap();
        assert_eq!(response.into_result().unwrap(), serde_json::json!({"tools": []}));
        assert!(find_sse_response(body, 4).is_err());
    }

    #[test]
    fn rpc_error_becomes_err() {
        let response: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        let err = response.into_result().unwrap_err();
        assert_eq!(err.to_string(), "MCP error -32601: Method not found");
    }

    #[test]
    fn http_endpoint_appends_mcp_path() {
        let transport =
            HttpTransport::new("http://127.0.0.1:8089/", Duration::from_secs(5)).unwrap();
        assert_eq!(transport.endpoint, "http://127.0.0.1:8089/mcp");
    }

    #[tokio::test]
    async fn stdio_request_skips_unrelated_lines() {
        // A fake server that prints a log line and a notification before replying
        let script = r#"read line; echo 'starting up'; echo '{"jsonrpc":"2.0","method":"notifications/message"}'; echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'"#;
        let transport = StdioTransport::spawn(
            "sh",
            &["-c".to_string(), script.to_string()],
            &HashMap::new(),
        )
        .await
        .unwrap();

        let result = transport.request("ping", None).await.unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }
}
