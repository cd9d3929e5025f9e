//! Public entry point: render prompts, snapshot tools, run the loop

use super::error::ChatError;
use super::orchestrator::{ChatAnswer, ChatOrchestrator};
use super::status::{StatusReporter, StatusSink, STATUS_PREPARING};
use crate::config::Config;
use crate::llm::{ChatBackend, OllamaClient};
use crate::mcp::{wrap_all_tools, McpServerManager};
use crate::pool::{BackendPool, BackendServer};
use crate::templates::{TemplateArgs, TemplateSet};
use crate::tools::{ToolNames, ToolRegistry};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

/// Wires templates, tools and the backend pool together
pub struct Assistant {
    templates: TemplateSet,
    registry: Arc<ToolRegistry>,
    orchestrator: ChatOrchestrator,
    chat_timeout: Duration,
    /// Kept alive so stdio MCP children are not killed while we use them
    mcp: Option<Arc<McpServerManager>>,
}

impl Assistant {
    pub fn new(
        templates: TemplateSet,
        registry: Arc<ToolRegistry>,
        orchestrator: ChatOrchestrator,
    ) -> Self {
        Self {
            templates,
            registry,
            orchestrator,
            chat_timeout: Duration::from_secs(600),
            mcp: None,
        }
    }

    pub fn with_chat_timeout(mut self, timeout: Duration) -> Self {
        self.chat_timeout = timeout;
        self
    }

    /// Build everything from config, connecting to the configured MCP servers
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        config.validate()?;
        let limits = &config.limits;

        let templates = TemplateSet::load(&config.templates.system, &config.templates.user)
            .context("Failed to load prompt templates")?;

        let client: Arc<dyn ChatBackend> = Arc::new(OllamaClient::new(limits.request_timeout())?);
        let servers = config
            .backends
            .iter()
            .map(|(name, url)| BackendServer::new(name.clone(), url.trim_end_matches('/')))
            .collect();
        let pool = BackendPool::new(config.model.clone(), servers, client)
            .with_poll_interval(limits.poll_interval())
            .with_probe_timeout(limits.probe_timeout());

        let registry = Arc::new(ToolRegistry::new().with_tool_timeout(limits.tool_timeout()));
        let mcp = if config.mcp_servers.is_empty() {
            None
        } else {
            let manager = Arc::new(McpServerManager::new(limits.request_timeout()));
            manager.load_config(&config.mcp_servers).await;
            let connected = manager.connect_all().await;
            let tools = wrap_all_tools(&manager).await;
            tracing::info!(
                "Connected {} MCP servers exposing {} tools",
                connected,
                tools.len()
            );
            registry.register_all(tools).await;
            Some(manager)
        };

        let orchestrator = ChatOrchestrator::new(Arc::new(pool))
            .with_max_tool_rounds(limits.max_tool_rounds)
            .with_tool_names(ToolNames::new(config.tool_names.clone()));

        let mut assistant = Self::new(templates, registry, orchestrator)
            .with_chat_timeout(limits.chat_timeout());
        assistant.mcp = mcp;
        Ok(assistant)
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        self.orchestrator.pool()
    }

    pub fn mcp(&self) -> Option<&Arc<McpServerManager>> {
        self.mcp.as_ref()
    }

    /// Deadline for an invocation starting now
    pub fn default_deadline(&self) -> Instant {
        Instant::now() + self.chat_timeout
    }

    /// Answer `message`, reporting progress to `status` if given
    ///
    /// `context` fills both templates; the user template also sees the raw
    /// message under `Message`.
    pub async fn chat(
        &self,
        message: &str,
        context: &TemplateArgs,
        status: Option<&mut dyn StatusSink>,
        deadline: Instant,
    ) -> Result<String, ChatError> {
        self.chat_detailed(message, context, status, deadline)
            .await
            .map(|answer| answer.text)
    }

    /// Same as [`Assistant::chat`] but keeps the bookkeeping
    pub async fn chat_detailed(
        &self,
        message: &str,
        context: &TemplateArgs,
        status: Option<&mut dyn StatusSink>,
        deadline: Instant,
    ) -> Result<ChatAnswer, ChatError> {
        let span = tracing::info_span!("chat", request = %uuid::Uuid::new_v4());
        let mut reporter = StatusReporter::new(status);
        reporter.emit(STATUS_PREPARING);

        let (system, user) = span.in_scope(|| {
            Ok::<_, ChatError>((
                self.templates.render_system(context)?,
                self.templates.render_user(message, context)?,
            ))
        })?;
        let catalog = self.registry.snapshot().await;

        self.orchestrator
            .run_reporting(&system, &user, &catalog, &mut reporter, deadline)
            .instrument(span)
            .await
    }
}
