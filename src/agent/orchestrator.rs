//! The tool-augmented chat loop
//!
//! One invocation leases a backend, then alternates model calls with tool
//! dispatch until the model answers without asking for tools. Tool calls from
//! one assistant turn run one after another in the order the model gave them.

use super::context::Conversation;
use super::error::ChatError;
use super::status::{
    status_processing_tools, status_thinking, StatusReporter, StatusSink, STATUS_FINDING_SERVER,
    STATUS_FORMATTING,
};
use crate::llm::{ChatReply, ToolCall};
use crate::pool::{BackendPool, BackendServer};
use crate::tools::{ToolCatalog, ToolError, ToolNames};
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};

pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 10;

/// Final answer plus how the invocation got there
#[derive(Debug, Clone)]
pub struct ChatAnswer {
    pub text: String,
    /// Backend that served the whole conversation
    pub backend: BackendServer,
    pub model_calls: usize,
    pub tool_rounds: usize,
    pub conversation: Conversation,
}

pub struct ChatOrchestrator {
    pool: Arc<BackendPool>,
    max_tool_rounds: usize,
    tool_names: ToolNames,
}

impl ChatOrchestrator {
    pub fn new(pool: Arc<BackendPool>) -> Self {
        Self {
            pool,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            tool_names: ToolNames::default(),
        }
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn with_tool_names(mut self, names: ToolNames) -> Self {
        self.tool_names = names;
        self
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    /// Run one conversation to completion
    ///
    /// The leased backend is released exactly once on every exit path,
    /// including when this future is dropped mid-flight.
    pub async fn run(
        &self,
        system: &str,
        user: &str,
        catalog: &ToolCatalog,
        status: Option<&mut dyn StatusSink>,
        deadline: Instant,
    ) -> Result<ChatAnswer, ChatError> {
        let mut reporter = StatusReporter::new(status);
        self.run_reporting(system, user, catalog, &mut reporter, deadline)
            .await
    }

    pub(crate) async fn run_reporting(
        &self,
        system: &str,
        user: &str,
        catalog: &ToolCatalog,
        status: &mut StatusReporter<'_>,
        deadline: Instant,
    ) -> Result<ChatAnswer, ChatError> {
        let mut conversation = Conversation::new(system, user);

        status.emit(STATUS_FINDING_SERVER);
        let lease = self.pool.select_server(deadline).await?;
        let server = lease.server().clone();
        status.emit(&status_thinking(&server.name));

        let mut model_calls = 0;
        let mut rounds = 0;
        loop {
            let reply = self
                .model_call(&server, &conversation, catalog, deadline)
                .await?;
            model_calls += 1;

            let calls = reply.tool_calls().to_vec();
            conversation.push(reply.message);

            if calls.is_empty() {
                status.emit(STATUS_FORMATTING);
                let text = conversation
                    .last()
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                tracing::info!(
                    "Chat finished on {} after {} model calls, {} tool rounds",
                    server.name,
                    model_calls,
                    rounds
                );
                drop(lease);
                return Ok(ChatAnswer {
                    text,
                    backend: server,
                    model_calls,
                    tool_rounds: rounds,
                    conversation,
                });
            }

            rounds += 1;
            if rounds > self.max_tool_rounds {
                tracing::warn!(
                    "Model on {} still requesting tools after {} rounds, giving up",
                    server.name,
                    self.max_tool_rounds
                );
                return Err(ChatError::ToolLoopExceeded {
                    rounds: self.max_tool_rounds,
                });
            }

            self.dispatch(&calls, catalog, &mut conversation, status, deadline)
                .await?;
            status.emit(&status_processing_tools(&server.name));
        }
    }

    async fn model_call(
        &self,
        server: &BackendServer,
        conversation: &Conversation,
        catalog: &ToolCatalog,
        deadline: Instant,
    ) -> Result<ChatReply, ChatError> {
        tracing::debug!(
            "Sending {} messages and {} tools to {}",
            conversation.len(),
            catalog.len(),
            server.name
        );
        let call = self.pool.backend().chat(
            &server.url,
            self.pool.model(),
            conversation.messages(),
            catalog.definitions(),
        );

        match timeout_at(deadline, call).await {
            Ok(Ok(reply)) => {
                let meta = &reply.metadata;
                tracing::debug!(
                    "Reply from {}: done_reason={:?} prompt_tokens={:?} eval_tokens={:?} took={:?}",
                    server.name,
                    meta.done_reason,
                    meta.prompt_eval_count,
                    meta.eval_count,
                    meta.total_duration
                );
                Ok(reply)
            }
            Ok(Err(e)) => {
                tracing::error!("Chat call to {} failed: {}", server.name, e);
                Err(ChatError::Backend(e))
            }
            Err(_) => {
                tracing::error!("Chat call to {} cut short by deadline", server.name);
                Err(ChatError::DeadlineExceeded)
            }
        }
    }

    /// Run each requested tool in order and append one tool message per call
    async fn dispatch(
        &self,
        calls: &[ToolCall],
        catalog: &ToolCatalog,
        conversation: &mut Conversation,
        status: &mut StatusReporter<'_>,
        deadline: Instant,
    ) -> Result<(), ChatError> {
        for call in calls {
            if !catalog.contains(&call.name) {
                tracing::warn!("Tool not found: {}", call.name);
                conversation.add_tool_result(&call.name, not_found(&call.name));
                continue;
            }

            status.emit(self.tool_names.display(&call.name));
            tracing::debug!("Executing tool {} with args {}", call.name, call.arguments);

            let outcome = timeout_at(deadline, catalog.call(&call.name, call.arguments.clone()))
                .await
                .map_err(|_| ChatError::DeadlineExceeded)?;

            let content = match outcome {
                Ok(lines) => lines.join("\n"),
                Err(ToolError::NotFound(_)) => not_found(&call.name),
                Err(e) => {
                    tracing::warn!("Unable to call tool {}: {}", call.name, e);
                    format!("Tool '{}' call error: {}", call.name, e)
                }
            };
            conversation.add_tool_result(&call.name, content);
        }
        Ok(())
    }
}

fn not_found(name: &str) -> String {
    format!("Tool '{}' not found", name)
}
