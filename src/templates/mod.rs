//! Prompt templates
//!
//! Templates are plain text with `{{ .Key }}` (or `{{ Key }}`) placeholders.
//! They are parsed once when loaded, and rendering fails loudly on a key the
//! caller did not supply rather than leaving a hole in the prompt.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Reserved argument key under which the raw user message is passed
pub const MESSAGE_KEY: &str = "Message";
pub const SYSTEM_TEMPLATE: &str = "system";
pub const USER_TEMPLATE: &str = "user";

/// Key/value arguments available to a template
pub type TemplateArgs = BTreeMap<String, Value>;

static KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\.?([A-Za-z_][A-Za-z0-9_]*)$").expect("valid key regex"));

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read template '{name}' from {path}: {source}")]
    Io {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template '{name}' is malformed at byte {offset}: {reason}")]
    Parse {
        name: String,
        offset: usize,
        reason: String,
    },

    #[error("template '{name}' references '{key}' which was not provided")]
    MissingKey { name: String, key: String },

    #[error("no template named '{0}'")]
    UnknownTemplate(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Key(String),
}

/// A parsed template
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(name: &str, source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after_open = &rest[open + 2..];
            let close = after_open.find("}}").ok_or_else(|| TemplateError::Parse {
                name: name.to_string(),
                offset: offset + open,
                reason: "unclosed '{{'".to_string(),
            })?;

            let action = after_open[..close].trim();
            let key = KEY_RE
                .captures(action)
                .and_then(|c| c.get(1))
                .ok_or_else(|| TemplateError::Parse {
                    name: name.to_string(),
                    offset: offset + open,
                    reason: format!("unsupported action '{{{{{}}}}}'", action),
                })?;
            segments.push(Segment::Key(key.as_str().to_string()));

            let consumed = open + 2 + close + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            segments,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keys this template needs, in order of first use
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Key(key) = segment {
                if !keys.contains(&key.as_str()) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    pub fn render(&self, args: &TemplateArgs) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Key(key) => {
                    let value = args.get(key).ok_or_else(|| TemplateError::MissingKey {
                        name: self.name.clone(),
                        key: key.clone(),
                    })?;
                    push_value(&mut out, value);
                }
            }
        }
        Ok(out)
    }
}

fn push_value(out: &mut String, value: &Value) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Null => {}
        other => out.push_str(&other.to_string()),
    }
}

/// Named templates loaded once at startup
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: HashMap<String, Template>,
}

impl TemplateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the system and user templates from disk
    pub fn load(system: &Path, user: &Path) -> Result<Self, TemplateError> {
        let mut set = Self::new();
        set.add_file(SYSTEM_TEMPLATE, system)?;
        set.add_file(USER_TEMPLATE, user)?;
        Ok(set)
    }

    pub fn add_file(&mut self, name: &str, path: &Path) -> Result<(), TemplateError> {
        let source = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
            name: name.to_string(),
            path: path.to_path_buf(),
            source,
        })?;
        self.add(name, &source)
    }

    pub fn add(&mut self, name: &str, source: &str) -> Result<(), TemplateError> {
        let template = Template::parse(name, source)?;
        self.templates.insert(name.to_string(), template);
        Ok(())
    }

    pub fn render(&self, name: &str, args: &TemplateArgs) -> Result<String, TemplateError> {
        self.templates
            .get(name)
            .ok_or_else(|| TemplateError::UnknownTemplate(name.to_string()))?
            .render(args)
    }

    pub fn render_system(&self, context: &TemplateArgs) -> Result<String, TemplateError> {
        self.render(SYSTEM_TEMPLATE, context)
    }

    /// Render the user template with `message` under [`MESSAGE_KEY`]
    ///
    /// The raw message wins over a context entry of the same name.
    pub fn render_user(
        &self,
        message: &str,
        context: &TemplateArgs,
    ) -> Result<String, TemplateError> {
        let mut args = context.clone();
        args.insert(MESSAGE_KEY.to_string(), Value::String(message.to_string()));
        self.render(USER_TEMPLATE, &args)
    }
}
