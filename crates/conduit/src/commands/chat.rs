//! Chat command - one-shot turn or interactive REPL.

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use console::Style;
use futures::StreamExt;

use conduit_agent::{AgentConfig, AgentRuntime, CancellationToken, StreamChunk};
use conduit_config::RuntimeConfig;
use conduit_llm::SharedBackend;
use conduit_mcp::AdapterSet;
use conduit_resilience::ResilienceLayer;
use conduit_session::{EnterReport, Session, SessionOptions};

use super::repl::Repl;
use super::{Context, build_backend};

/// Arguments for the chat command.
#[derive(Args, Debug)]
pub struct ChatArgs {
    /// Send a single message and exit instead of starting the REPL
    #[arg(short, long)]
    pub message: Option<String>,

    /// Stream the one-shot reply as it is generated
    #[arg(long)]
    pub stream: bool,

    /// Override the configured model
    #[arg(long)]
    pub model: Option<String>,
}

/// Run the chat command.
///
/// Everything that can fail without touching a server is prepared before the
/// session is entered, and once entered the session is always exited.
pub async fn run(args: ChatArgs, ctx: &Context) -> Result<()> {
    let config = ctx.load_config()?;
    let registry = config.registry()?;
    let (backend, agent_config) = prepare(&args, &config)?;

    let session = Arc::new(Session::from_registry(
        &registry,
        AdapterSet::standard(),
        SessionOptions::from_section(&config.session),
    ));
    let report = session.enter().await?;
    print_report(&session, &report, ctx);

    let outcome = converse(&args, ctx, || {
        AgentRuntime::builder()
            .with_backend(backend)
            .with_session(session.clone())
            .with_resilience(ResilienceLayer::shared(&config.resilience))
            .with_config(agent_config)
            .build()
    })
    .await;

    let released = session.exit().await;
    outcome.and(released.map_err(anyhow::Error::from))
}

/// Backend and agent settings, validated before any server is contacted.
fn prepare(args: &ChatArgs, config: &RuntimeConfig) -> Result<(SharedBackend, AgentConfig)> {
    let mut agent_config = AgentConfig::from_config(config);
    if let Some(ref model) = args.model {
        agent_config.model = model.clone();
    }
    anyhow::ensure!(
        !agent_config.model.trim().is_empty(),
        "no model configured: set `model` under [llm] or pass --model"
    );
    Ok((build_backend(config)?, agent_config))
}

async fn converse(
    args: &ChatArgs,
    ctx: &Context,
    build: impl FnOnce() -> conduit_agent::Result<AgentRuntime>,
) -> Result<()> {
    let agent = build()?;
    match args.message {
        Some(ref message) if args.stream => stream_once(&agent, message, ctx).await,
        Some(ref message) => chat_once(&agent, message, ctx).await,
        None => Repl::new(agent, ctx.verbose)?.run().await,
    }
}

fn print_report(session: &Session, report: &EnterReport, ctx: &Context) {
    if ctx.json_output {
        return;
    }
    let yellow = Style::new().yellow();
    for server in report.failed() {
        eprintln!(
            "{} server '{}' unavailable: {}",
            yellow.apply_to("warning:"),
            server.name,
            server.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    if ctx.verbose {
        eprintln!(
            "session {}: {} server(s) connected, {} tool(s)",
            session.id(),
            report.connected().count(),
            report.tool_count
        );
    }
}

async fn chat_once(agent: &AgentRuntime, message: &str, ctx: &Context) -> Result<()> {
    let response = agent.chat(message).await?;
    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("{}", response.text);
    }
    Ok(())
}

async fn stream_once(agent: &AgentRuntime, message: &str, ctx: &Context) -> Result<()> {
    let cancellation = cancel_on_ctrl_c();
    let mut stream = agent.chat_stream(message, cancellation.clone());
    let mut failed = None;

    while let Some(chunk) = stream.next().await {
        if ctx.json_output {
            println!("{}", serde_json::to_string(&chunk)?);
            if let StreamChunk::Error { message, .. } = chunk {
                failed = Some(message);
            }
            continue;
        }
        match chunk {
            StreamChunk::Text { content } => {
                print!("{}", content);
                std::io::stdout().flush()?;
            }
            StreamChunk::ToolStart { name, .. } => eprintln!("\n[Running: {}]", name),
            StreamChunk::ToolEnd { success, .. } => {
                eprintln!("[{}]", if success { "done" } else { "failed" })
            }
            StreamChunk::Done { .. } => println!(),
            StreamChunk::Error { message, .. } => failed = Some(message),
        }
    }
    cancellation.cancel();

    match failed {
        Some(message) => Err(anyhow::anyhow!(message)),
        None => Ok(()),
    }
}

/// A token cancelled by the first Ctrl+C. Cancelling it also stops the watcher.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let watcher = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = watcher.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    watcher.cancel();
                }
            }
        }
    });
    token
}
