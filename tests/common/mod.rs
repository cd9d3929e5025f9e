//! Shared fixtures: a scripted chat backend and in-memory tools

#![allow(dead_code)]

use async_trait::async_trait;
use llm_relay::llm::{
    ChatBackend, ChatReply, CompletionMetadata, LlmError, Message, ToolCall, ToolDefinition,
};
use llm_relay::pool::{BackendPool, BackendServer};
use llm_relay::tools::Tool;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the backend does on its next chat call
pub enum Step {
    Reply(Message),
    Fail(String),
    /// Never answers
    Hang,
}

/// In-memory backend that plays back a script of replies
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Step>>,
    /// Replayed once the script runs out
    repeat: Option<Message>,
    dead: HashSet<String>,
    /// Accept the probe but never answer it
    hung: HashSet<String>,
    probe_delay: Duration,
    chat_delay: Duration,
    chat_calls: AtomicUsize,
    probes: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<Vec<Message>>>,
    advertised: Mutex<Vec<Vec<String>>>,
    in_flight: Mutex<HashMap<String, usize>>,
    overlap_seen: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat: None,
            dead: HashSet::new(),
            hung: HashSet::new(),
            probe_delay: Duration::ZERO,
            chat_delay: Duration::ZERO,
            chat_calls: AtomicUsize::new(0),
            probes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            advertised: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            overlap_seen: AtomicUsize::new(0),
        }
    }

    /// Answer every call with `message`
    pub fn always(message: Message) -> Self {
        Self {
            repeat: Some(message),
            ..Self::new(Vec::new())
        }
    }

    pub fn with_dead(mut self, urls: &[&str]) -> Self {
        self.dead = urls.iter().map(|u| u.to_string()).collect();
        self
    }

    pub fn with_hung(mut self, urls: &[&str]) -> Self {
        self.hung = urls.iter().map(|u| u.to_string()).collect();
        self
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    pub fn with_chat_delay(mut self, delay: Duration) -> Self {
        self.chat_delay = delay;
        self
    }

    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    pub fn probes_of(&self, url: &str) -> usize {
        self.probes.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_probes(&self) -> usize {
        self.probes.lock().unwrap().values().sum()
    }

    /// Conversation sent on each chat call
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }

    /// Tool names advertised on each chat call
    pub fn advertised(&self) -> Vec<Vec<String>> {
        self.advertised.lock().unwrap().clone()
    }

    /// How many times two chat calls overlapped on the same server
    pub fn overlaps(&self) -> usize {
        self.overlap_seen.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        let mut script = self.script.lock().unwrap();
        match script.pop_front() {
            Some(step) => step,
            None => match &self.repeat {
                Some(message) => Step::Reply(message.clone()),
                None => Step::Fail("script exhausted".into()),
            },
        }
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn probe(&self, base_url: &str, _model: &str) -> Result<(), LlmError> {
        *self
            .probes
            .lock()
            .unwrap()
            .entry(base_url.to_string())
            .or_default() += 1;
        if self.hung.contains(base_url) {
            std::future::pending::<()>().await;
        }
        if !self.probe_delay.is_zero() {
            tokio::time::sleep(self.probe_delay).await;
        }
        if self.dead.contains(base_url) {
            Err(LlmError::Network("Connection failed: refused".into()))
        } else {
            Ok(())
        }
    }

    async fn chat(
        &self,
        base_url: &str,
        _model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChatReply, LlmError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(messages.to_vec());
        self.advertised
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.name.clone()).collect());

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(base_url.to_string()).or_default();
            *count += 1;
            if *count > 1 {
                self.overlap_seen.fetch_add(1, Ordering::SeqCst);
            }
        }
        if !self.chat_delay.is_zero() {
            tokio::time::sleep(self.chat_delay).await;
        }
        let step = self.next_step();
        if let Some(count) = self.in_flight.lock().unwrap().get_mut(base_url) {
            *count -= 1;
        }

        match step {
            Step::Reply(message) => Ok(ChatReply {
                message,
                metadata: CompletionMetadata {
                    done_reason: Some("stop".into()),
                    ..Default::default()
                },
            }),
            Step::Fail(reason) => Err(LlmError::ServiceError(reason)),
            Step::Hang => std::future::pending().await,
        }
    }
}

pub fn servers(urls: &[&str]) -> Vec<BackendServer> {
    urls.iter()
        .enumerate()
        .map(|(i, url)| BackendServer::new(format!("gpu-{}", i + 1), *url))
        .collect()
}

pub fn pool_with(backend: Arc<ScriptedBackend>, urls: &[&str]) -> Arc<BackendPool> {
    Arc::new(
        BackendPool::new("qwen3:14b", servers(urls), backend)
            .with_poll_interval(Duration::from_millis(20)),
    )
}

pub fn tool_turn(calls: Vec<(&str, Value)>) -> Message {
    Message::assistant_tool_calls(
        "",
        calls
            .into_iter()
            .map(|(name, args)| ToolCall::new(name, args))
            .collect(),
    )
}

/// Returns fixed lines and counts its calls
pub struct StaticTool {
    name: &'static str,
    lines: Vec<String>,
    pub calls: Arc<Mutex<Vec<Value>>>,
}

impl StaticTool {
    pub fn new(name: &'static str, lines: &[&str]) -> Self {
        Self {
            name,
            lines: lines.iter().map(|l| l.to_string()).collect(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn weather() -> Self {
        Self::new("weather", &["22C clear"])
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "returns canned lines"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"city": {"type": "string"}}
        })
    }

    async fn call(&self, arguments: Value) -> anyhow::Result<Vec<String>> {
        self.calls.lock().unwrap().push(arguments);
        Ok(self.lines.clone())
    }
}

/// Always fails with the given message
pub struct FailingTool {
    name: &'static str,
    message: &'static str,
}

impl FailingTool {
    pub fn new(name: &'static str, message: &'static str) -> Self {
        Self { name, message }
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "always fails"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object"})
    }

    async fn call(&self, _arguments: Value) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("{}", self.message)
    }
}
