//! Progress reporting for a chat invocation
//!
//! A sink receives one human-readable line per state change. It is called from
//! the invocation's own task, one call at a time, so it needs no locking.

use once_cell::sync::Lazy;
use regex::Regex;

pub const STATUS_PREPARING: &str = "📝 Preparing message templates...";
pub const STATUS_FINDING_SERVER: &str = "🔍 Finding available Ollama server...";
pub const STATUS_FORMATTING: &str = "✨ Formatting response...";

pub fn status_thinking(backend: &str) -> String {
    format!("🤖 AI is thinking... (using {})", backend)
}

pub fn status_processing_tools(backend: &str) -> String {
    format!("🤖 AI is processing tool results... (using {})", backend)
}

/// Receives status updates
pub trait StatusSink: Send {
    fn status(&mut self, text: &str);
}

impl<F> StatusSink for F
where
    F: FnMut(&str) + Send,
{
    fn status(&mut self, text: &str) {
        self(text)
    }
}

/// Optional sink threaded through one invocation
pub struct StatusReporter<'a> {
    sink: Option<&'a mut dyn StatusSink>,
}

impl<'a> StatusReporter<'a> {
    pub fn new(sink: Option<&'a mut dyn StatusSink>) -> Self {
        Self { sink }
    }

    pub fn emit(&mut self, text: &str) {
        tracing::debug!("status: {}", text);
        if let Some(sink) = self.sink.as_deref_mut() {
            sink.status(text);
        }
    }
}

static LEADING_SYMBOL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\p{So}").expect("valid symbol regex"));

/// Accumulated status lines for display
///
/// Every line but the newest has its leading pictograph replaced by ✅.
#[derive(Debug, Clone, Default)]
pub struct StatusHistory {
    lines: Vec<String>,
}

impl StatusHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: &str) {
        self.lines.push(text.to_string());
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Render with the newest line still in progress
    pub fn render(&self) -> String {
        let last = self.lines.len().saturating_sub(1);
        self.lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                if i < last {
                    mark_done(line)
                } else {
                    line.clone()
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Render with every line marked done
    pub fn render_finished(&self) -> String {
        self.lines
            .iter()
            .map(|line| mark_done(line))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn mark_done(line: &str) -> String {
    LEADING_SYMBOL.replace(line, "✅").into_owned()
}
