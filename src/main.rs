use anyhow::Result;
use clap::{Parser, Subcommand};
use llm_relay::agent::Assistant;
use llm_relay::config::Config;
use llm_relay::transport::cli;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    env!("LLM_RELAY_VERSION_SUFFIX")
);

#[derive(Parser)]
#[command(name = "llm-relay")]
#[command(author, version = VERSION, long_about = None)]
#[command(about = "Chat with a pool of Ollama servers, with MCP tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: $LLM_RELAY_CONFIG or the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question and print the answer
    Chat {
        /// The message to send
        message: String,

        /// Name passed to the templates as Username and UserId
        #[arg(short, long)]
        user: Option<String>,

        /// Extra template variable, KEY=VALUE (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Give up after this many seconds (default: limits.chat_timeout_secs)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// List the tools exposed by the configured MCP servers
    Tools,

    /// Probe every configured backend
    Servers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "llm_relay=debug"
    } else {
        "llm_relay=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Chat {
            message,
            user,
            vars,
            timeout,
        } => {
            let mut context = cli::parse_vars(&vars)?;
            let user = user
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "cli".to_string());
            context
                .entry("Username".to_string())
                .or_insert_with(|| user.clone().into());
            context
                .entry("UserId".to_string())
                .or_insert_with(|| user.into());

            let assistant = Assistant::from_config(&config).await?;
            cli::run_chat(
                &assistant,
                &message,
                &context,
                timeout.map(Duration::from_secs),
            )
            .await?;
        }
        Commands::Tools => {
            let assistant = Assistant::from_config(&config).await?;
            cli::run_tools(&assistant).await?;
        }
        Commands::Servers => {
            let assistant = Assistant::from_config(&config).await?;
            cli::run_servers(&assistant).await?;
        }
    }

    Ok(())
}
