//! Configuration management for llm-relay

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that points at a config file
pub const CONFIG_ENV_VAR: &str = "LLM_RELAY_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Model name requested from every backend
    pub model: String,
    /// Backend name -> base URL
    pub backends: BTreeMap<String, String>,
    pub templates: TemplatesConfig,
    /// Raw tool name -> text shown in status updates
    pub tool_names: HashMap<String, String>,
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplatesConfig {
    pub system: PathBuf,
    pub user: PathBuf,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            system: PathBuf::from("templates/system.tmpl"),
            user: PathBuf::from("templates/user.tmpl"),
        }
    }
}

/// A tool provider reachable over MCP
///
/// Either `url` (streamable HTTP) or `command` (stdio child process) is set.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct McpServerConfig {
    pub url: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub enabled: Option<bool>,
}

impl McpServerConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Timeout for every HTTP request to a backend
    pub request_timeout_secs: u64,
    /// Default deadline for one chat invocation
    pub chat_timeout_secs: u64,
    /// Back-off between pool sweeps when every backend is busy or down
    pub poll_interval_ms: u64,
    /// Tool-call rounds allowed before the conversation is abandoned
    pub max_tool_rounds: usize,
    /// Timeout for a single tool call
    pub tool_timeout_secs: u64,
    /// How long one liveness probe may take before the server is skipped
    pub probe_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 120,
            chat_timeout_secs: 600,
            poll_interval_ms: 500,
            max_tool_rounds: 10,
            tool_timeout_secs: 60,
            probe_timeout_ms: 2000,
        }
    }
}

impl LimitsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn chat_timeout(&self) -> Duration {
        Duration::from_secs(self.chat_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Config {
    /// Load from an explicit path, `$LLM_RELAY_CONFIG`, or the default location
    ///
    /// A missing default file yields `Config::default()`; an explicitly named
    /// file that does not exist is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::load_from(Path::new(&path));
        }

        let config_path = Self::config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::debug!("No config at {}, using defaults", config_path.display());
            Ok(Config::default())
        }
    }

    /// Parse a TOML config file; relative template paths resolve against its directory
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        if let Some(base) = path.parent() {
            config.templates.system = resolve(base, &config.templates.system);
            config.templates.user = resolve(base, &config.templates.user);
        }
        Ok(config)
    }

    /// Get the default configuration file path
    pub fn config_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "llm-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Reject configurations the relay cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            anyhow::bail!("`model` must be set");
        }
        if self.backends.is_empty() {
            anyhow::bail!("at least one entry under [backends] is required");
        }

        let mut seen = HashSet::new();
        for (name, address) in &self.backends {
            let parsed = url::Url::parse(address)
                .with_context(|| format!("backend '{}' has an invalid URL '{}'", name, address))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                anyhow::bail!("backend '{}' must use http or https, got '{}'", name, address);
            }
            if !seen.insert(address.trim_end_matches('/')) {
                anyhow::bail!("backend URL '{}' is configured more than once", address);
            }
        }

        for (name, server) in &self.mcp_servers {
            match (&server.url, &server.command) {
                (Some(_), Some(_)) => {
                    anyhow::bail!("mcp server '{}' sets both `url` and `command`", name)
                }
                (None, None) => anyhow::bail!("mcp server '{}' needs `url` or `command`", name),
                _ => {}
            }
        }

        if self.limits.max_tool_rounds == 0 {
            anyhow::bail!("limits.max_tool_rounds must be at least 1");
        }
        let limits = [
            ("poll_interval_ms", self.limits.poll_interval_ms),
            ("probe_timeout_ms", self.limits.probe_timeout_ms),
            ("request_timeout_secs", self.limits.request_timeout_secs),
            ("chat_timeout_secs", self.limits.chat_timeout_secs),
            ("tool_timeout_secs", self.limits.tool_timeout_secs),
        ];
        for (key, value) in limits {
            if value == 0 {
                anyhow::bail!("limits.{} must be at least 1", key);
            }
        }
        Ok(())
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
