//! Conduit - conversational agent runtime over MCP tool servers
//!
//! Main entry point for the Conduit CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{chat, servers};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Conduit - conversational agent runtime over MCP tool servers
#[derive(Parser)]
#[command(name = "conduit")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file (default: ~/.config/conduit/conduit.toml)
    #[arg(long, global = true, env = "CONDUIT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Tool server registry management
    Servers(servers::ServersArgs),

    /// Chat with the agent (one-shot or interactive)
    Chat(chat::ChatArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

const CRATES: &[&str] = &[
    "conduit",
    "conduit_agent",
    "conduit_session",
    "conduit_resilience",
    "conduit_mcp",
    "conduit_llm",
    "conduit_config",
];

fn filter(level: &str, fallback: &str) -> String {
    let mut directives: Vec<String> = CRATES.iter().map(|c| format!("{c}={level}")).collect();
    directives.push(fallback.to_string());
    directives.join(",")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Console gets human-readable output, the log directory gets daily JSON files.
    let console_filter = if cli.verbose {
        filter("debug", "info")
    } else {
        filter("warn", "error")
    };

    let log_dir = conduit_config::config_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "conduit.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(console_filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(filter("trace", "info"))),
        )
        .init();

    let ctx = commands::Context {
        config_path: cli.config,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Servers(args) => servers::run(args, &ctx).await,
        Commands::Chat(args) => chat::run(args, &ctx).await,
    }
}
