//! CLI transport for direct terminal interaction

use crate::agent::{Assistant, ChatError, StatusHistory};
use crate::llm::{strip_thinking, ChatBackend};
use crate::templates::TemplateArgs;
use anyhow::{Context, Result};
use colored::Colorize;
use crate::mcp::ConnectionStatus;
use std::sync::Arc;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};
use tokio::time::Instant;

/// Longest answer printed, in characters
pub const MAX_ANSWER_CHARS: usize = 4096;

pub const EMPTY_ANSWER_FALLBACK: &str =
    "AI was thinking too hard so it provided no response... Try again later.";

/// Crop to `max` characters, ending in "..." when shortened
pub fn crop_text(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        return input.to_string();
    }
    let kept: String = input.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

/// Drop reasoning, fall back on an empty answer, crop for display
pub fn format_answer(raw: &str) -> String {
    let answer = strip_thinking(raw);
    if answer.is_empty() {
        EMPTY_ANSWER_FALLBACK.to_string()
    } else {
        crop_text(answer, MAX_ANSWER_CHARS)
    }
}

/// Parse `KEY=VALUE` pairs into template arguments
pub fn parse_vars(vars: &[String]) -> Result<TemplateArgs> {
    let mut args = TemplateArgs::new();
    for var in vars {
        let (key, value) = var
            .split_once('=')
            .with_context(|| format!("Expected KEY=VALUE, got '{}'", var))?;
        args.insert(key.trim().to_string(), value.into());
    }
    Ok(args)
}

/// Ask one question and print the answer
pub async fn run_chat(
    assistant: &Assistant,
    message: &str,
    context: &TemplateArgs,
    timeout: Option<Duration>,
) -> Result<()> {
    let deadline = timeout
        .map(|t| Instant::now() + t)
        .unwrap_or_else(|| assistant.default_deadline());
    let started = std::time::Instant::now();

    let mut history = StatusHistory::new();
    let mut sink = |status: &str| {
        history.push(status);
        eprintln!("{}", status.dimmed());
    };

    let result = assistant
        .chat(message, context, Some(&mut sink), deadline)
        .await;
    let elapsed = started.elapsed().as_secs_f64();

    match result {
        Ok(answer) => {
            eprintln!("\n{}", history.render_finished());
            println!("\n{}", format_answer(&answer));
            eprintln!("\n{}", format!("Response time: {:.2}s", elapsed).dimmed());
            Ok(())
        }
        Err(e) => {
            eprintln!("\n{}", history.render());
            eprintln!("{} {}", "Error:".red().bold(), e);
            if matches!(e, ChatError::NoBackendAvailable { .. }) {
                eprintln!("Run `llm-relay servers` to check which backends respond.");
            }
            Err(anyhow::Error::new(e))
        }
    }
}

/// List the tools the model will be offered
pub async fn run_tools(assistant: &Assistant) -> Result<()> {
    #[derive(Tabled)]
    struct ToolRow {
        #[tabled(rename = "Tool")]
        name: String,
        #[tabled(rename = "Description")]
        description: String,
    }

    let tools = assistant.registry().list_tools().await;
    if tools.is_empty() {
        println!("No tools registered. Configure [mcp_servers] to add some.");
        return Ok(());
    }

    let rows: Vec<ToolRow> = tools
        .into_iter()
        .map(|t| ToolRow {
            name: t.name,
            description: crop_text(&t.description, 80),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);
    Ok(())
}

/// Probe every backend once and show which ones serve the model
pub async fn run_servers(assistant: &Assistant) -> Result<()> {
    #[derive(Tabled)]
    struct ServerRow {
        #[tabled(rename = "Backend")]
        name: String,
        #[tabled(rename = "URL")]
        url: String,
        #[tabled(rename = "Status")]
        status: String,
    }

    let pool = assistant.pool();
    let backend: &Arc<dyn ChatBackend> = pool.backend();
    let mut rows = Vec::new();
    for server in pool.servers() {
        let status = match backend.probe(&server.url, pool.model()).await {
            Ok(()) => "✓ ready".green().to_string(),
            Err(e) => format!("✗ {}", crop_text(&e.to_string(), 60)).red().to_string(),
        };
        rows.push(ServerRow {
            name: server.name.clone(),
            url: server.url.clone(),
            status,
        });
    }

    println!("\n{} {}\n", "Model:".bold(), pool.model().cyan());
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);

    if let Some(manager) = assistant.mcp() {
        #[derive(Tabled)]
        struct McpRow {
            #[tabled(rename = "MCP server")]
            name: String,
            #[tabled(rename = "Status")]
            status: String,
        }

        let mut rows = Vec::new();
        for id in manager.server_ids().await {
            let status = manager.status(&id).await.unwrap_or_default();
            rows.push(McpRow {
                status: mcp_status_cell(&status),
                name: id,
            });
        }
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("\n{}", table);
    }
    Ok(())
}

fn mcp_status_cell(status: &ConnectionStatus) -> String {
    match status {
        ConnectionStatus::Connected => format!("✓ {}", status.display()).green().to_string(),
        ConnectionStatus::Failed(reason) => {
            format!("✗ {}: {}", status.display(), crop_text(reason, 60))
                .red()
                .to_string()
        }
        ConnectionStatus::Disconnected => status.display().yellow().to_string(),
    }
}
