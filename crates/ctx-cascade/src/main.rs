//! Run one compaction cycle over a saved conversation and print the result.
//!
//! Summarization goes through OpenRouter and reads the API key from the
//! `OPENROUTER_KEY` environment variable. Without a key (or with
//! `--offline`) Tier 3 fails and the cycle keeps whatever Tier 1/2 freed.
//!
//! # Examples
//!
//! ```sh
//! # Compact a log and write the result
//! ctx-cascade --conversation session.json --output compacted.json
//!
//! # Smaller window, tighter protected tail, no network
//! ctx-cascade --conversation session.json --offline \
//!   --set context_window_tokens=32000 --set protected_messages=6
//!
//! # Show the prompt the agent would send next
//! ctx-cascade --conversation session.json --system prompt.md --print-prompt
//! ```

use clap::Parser;
use ctx_cascade::DEFAULT_MODEL;
use ctx_cascade::api::{ModelProvider, OfflineProvider, OpenRouterClient};
use ctx_cascade::config::CompactionConfig;
use ctx_cascade::context::CompactionOrchestrator;
use ctx_cascade::conversation::Conversation;
use ctx_cascade::events::LoggingHandler;
use ctx_cascade::session::Session;
use ctx_cascade::Message;
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Run one compaction cycle over a conversation log.
#[derive(Parser)]
#[command(name = "ctx-cascade")]
struct Cli {
    /// JSON file holding the conversation (an array of messages)
    #[arg(long)]
    conversation: PathBuf,

    /// JSON config file; keys not given keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Config override as key=value (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// File holding the system prompt template
    #[arg(long)]
    system: Option<PathBuf>,

    /// Model driving the conversation
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Write the compacted conversation here
    #[arg(long)]
    output: Option<PathBuf>,

    /// Print the assembled prompt after the cycle
    #[arg(long)]
    print_prompt: bool,

    /// Never call a provider
    #[arg(long)]
    offline: bool,
}

fn load_config(cli: &Cli) -> Result<CompactionConfig, String> {
    let mut config = match &cli.config {
        Some(path) => CompactionConfig::from_path(path).map_err(|e| e.to_string())?,
        None => CompactionConfig::default(),
    };
    for assignment in &cli.overrides {
        config
            .apply_override(assignment)
            .map_err(|e| format!("--set {assignment}: {e}"))?;
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn load_conversation(path: &Path) -> Result<Conversation, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let messages: Vec<Message> = serde_json::from_str(&text)
        .map_err(|e| format!("failed to parse {}: {e}", path.display()))?;
    Ok(Conversation::from_messages(messages))
}

fn provider(cli: &Cli) -> Box<dyn ModelProvider> {
    if cli.offline {
        return Box::new(OfflineProvider);
    }
    match OpenRouterClient::from_env() {
        Ok(client) => Box::new(client),
        Err(e) => {
            tracing::warn!("{e}; summarization disabled");
            Box::new(OfflineProvider)
        }
    }
}

async fn run(cli: &Cli) -> Result<String, String> {
    let config = load_config(cli)?;
    let log = load_conversation(&cli.conversation)?;
    let template = match &cli.system {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?,
        None => String::new(),
    };

    let mut session = Session::from_conversation(log, &config);
    let orchestrator = CompactionOrchestrator::new(config).with_event_handler(LoggingHandler);
    let provider = provider(cli);

    let report = orchestrator
        .run_cycle_until(&mut session, provider.as_ref(), &cli.model, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    if let Some(path) = &cli.output {
        let json = serde_json::to_string_pretty(session.conversation().messages())
            .map_err(|e| format!("failed to serialize conversation: {e}"))?;
        std::fs::write(path, json)
            .map_err(|e| format!("failed to write {}: {e}", path.display()))?;
    }

    let mut out = report.to_log_string();
    out.push('\n');
    if report.degraded_mode_warning() {
        out.push_str("warning: summarization keeps failing and the conversation no longer fits\n");
    }
    if cli.print_prompt {
        out.push('\n');
        out.push_str(&session.assemble(&template));
    }
    Ok(out)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(&cli).await {
        Ok(output) => print!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
