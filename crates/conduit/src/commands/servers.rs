//! Tool server registry commands.
//!
//! - `conduit servers list` - List registered servers
//! - `conduit servers add` - Register a stdio, HTTP or SSE server
//! - `conduit servers remove` - Remove a server
//! - `conduit servers enable` / `disable` - Flip the persisted enabled flag
//! - `conduit servers test` - Connect once and list the server's tools

use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::json;

use conduit_config::{ServerDescriptor, ServerRegistry, TransportKind};
use conduit_mcp::AdapterSet;

use super::{Context, parse_pairs, truncate};

/// Tool server management commands.
#[derive(Args, Debug)]
pub struct ServersArgs {
    #[command(subcommand)]
    pub command: ServersCommand,
}

#[derive(Subcommand, Debug)]
pub enum ServersCommand {
    /// List registered servers
    List(ListArgs),

    /// Register a new server
    Add(AddArgs),

    /// Remove a server
    Remove(NameArgs),

    /// Enable a server for future sessions
    Enable(NameArgs),

    /// Disable a server for future sessions
    Disable(NameArgs),

    /// Connect to a server and list its tools
    Test(TestArgs),
}

/// Arguments for `conduit servers list`.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Connect to each enabled server and list its tools
    #[arg(long)]
    pub tools: bool,
}

/// Arguments for `conduit servers add`.
#[derive(Args, Debug)]
pub struct AddArgs {
    /// Unique name for this server
    pub name: String,

    /// Command to spawn (stdio) or endpoint URL (http, sse)
    pub target: String,

    /// Transport: stdio, http or sse
    #[arg(long, short = 't', default_value = "stdio")]
    pub transport: TransportKind,

    /// Arguments to pass to the command (stdio only)
    #[arg(last = true)]
    pub args: Vec<String>,

    /// Environment variables in KEY=VALUE format (stdio only)
    #[arg(long = "env", short = 'e')]
    pub env_vars: Vec<String>,

    /// HTTP header in KEY=VALUE format (http, sse)
    #[arg(long = "header", short = 'H')]
    pub headers: Vec<String>,

    /// Connect and invoke timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Register the server disabled
    #[arg(long)]
    pub disabled: bool,
}

/// A server name.
#[derive(Args, Debug)]
pub struct NameArgs {
    /// Name of the server
    pub name: String,
}

/// Arguments for `conduit servers test`.
#[derive(Args, Debug)]
pub struct TestArgs {
    /// Name of the server to test
    pub name: String,

    /// Show full tool schemas
    #[arg(long)]
    pub full: bool,
}

/// Run the servers command.
pub async fn run(args: ServersArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ServersCommand::List(list_args) => run_list(list_args, ctx).await,
        ServersCommand::Add(add_args) => run_add(add_args, ctx),
        ServersCommand::Remove(name) => run_remove(name, ctx),
        ServersCommand::Enable(name) => run_set_enabled(name, true, ctx),
        ServersCommand::Disable(name) => run_set_enabled(name, false, ctx),
        ServersCommand::Test(test_args) => run_test(test_args, ctx).await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// List
// ─────────────────────────────────────────────────────────────────────────────

async fn run_list(args: ListArgs, ctx: &Context) -> Result<()> {
    let registry = ctx.load_registry()?;
    let servers = registry.descriptors();

    if servers.is_empty() {
        if ctx.json_output {
            println!("[]");
        } else {
            println!("No tool servers registered.");
            println!();
            println!("Add a server with:");
            println!("  conduit servers add <name> <command> -- [args...]");
            println!("  conduit servers add <name> <url> --transport http");
        }
        return Ok(());
    }

    if ctx.json_output {
        let mut output = Vec::with_capacity(servers.len());
        for server in &servers {
            let mut entry = json!({
                "name": server.name,
                "transport": server.transport,
                "enabled": server.enabled,
                "target": server.target(),
                "timeout_secs": server.timeout_secs,
            });
            if args.tools && server.enabled {
                match list_tools(server).await {
                    Ok(tools) => {
                        entry["status"] = json!("connected");
                        entry["tools"] = json!(tools.iter().map(|(name, _)| name).collect::<Vec<_>>());
                    }
                    Err(e) => {
                        entry["status"] = json!("error");
                        entry["error"] = json!(e.to_string());
                    }
                }
            }
            output.push(entry);
        }
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!(
        "{:<20} {:<10} {:<10} {:<40}",
        "NAME", "TRANSPORT", "STATUS", "TARGET"
    );
    println!("{}", "-".repeat(80));

    for server in &servers {
        let status = if server.enabled { "enabled" } else { "disabled" };
        println!(
            "{:<20} {:<10} {:<10} {:<40}",
            truncate(&server.name, 20),
            server.transport.as_str(),
            status,
            truncate(&server.target(), 40)
        );

        if ctx.verbose {
            print_details(server);
        }

        if args.tools && server.enabled {
            match list_tools(server).await {
                Ok(tools) if tools.is_empty() => println!("  Tools: (none)"),
                Ok(tools) => {
                    println!("  Tools ({}):", tools.len());
                    for (name, _) in tools {
                        println!("    - {}", name);
                    }
                }
                Err(e) => println!("  Error: {}", e),
            }
        }
    }

    Ok(())
}

fn print_details(server: &ServerDescriptor) {
    if !server.env.is_empty() {
        println!("  Environment:");
        for (key, value) in &server.env {
            println!("    {}={}", key, value);
        }
    }
    if !server.headers.is_empty() {
        println!("  Headers:");
        for (key, value) in &server.headers {
            println!("    {}: {}", key, value);
        }
    }
    println!("  Timeout: {}s", server.timeout_secs);
}

/// Connect once, list tools, disconnect.
async fn list_tools(server: &ServerDescriptor) -> Result<Vec<(String, serde_json::Value)>> {
    let connection = AdapterSet::standard().connect(server).await?;
    let tools = connection.list_tools().await;
    if let Err(e) = connection.disconnect().await {
        tracing::debug!(server = %server.name, error = %e, "disconnect after listing failed");
    }
    Ok(tools?
        .into_iter()
        .map(|t| (t.name, t.input_schema))
        .collect())
}

// ─────────────────────────────────────────────────────────────────────────────
// Mutations
// ─────────────────────────────────────────────────────────────────────────────

/// Build a descriptor from `servers add` arguments.
fn descriptor_from_args(args: &AddArgs) -> Result<ServerDescriptor> {
    let mut descriptor = match args.transport {
        TransportKind::Stdio => {
            if !args.headers.is_empty() {
                anyhow::bail!("--header applies to http and sse servers only");
            }
            ServerDescriptor::stdio(&args.name, &args.target).with_args(args.args.iter().cloned())
        }
        TransportKind::Http | TransportKind::Sse => {
            if !args.args.is_empty() || !args.env_vars.is_empty() {
                anyhow::bail!("command arguments and --env apply to stdio servers only");
            }
            if args.transport == TransportKind::Http {
                ServerDescriptor::http(&args.name, &args.target)
            } else {
                ServerDescriptor::sse(&args.name, &args.target)
            }
        }
    };

    for (key, value) in parse_pairs(&args.env_vars, "environment variable")? {
        descriptor = descriptor.with_env(key, value);
    }
    for (key, value) in parse_pairs(&args.headers, "header")? {
        descriptor = descriptor.with_header(key, value);
    }
    if let Some(timeout) = args.timeout {
        descriptor = descriptor.with_timeout_secs(timeout);
    }
    Ok(descriptor.with_enabled(!args.disabled))
}

fn saved_to(registry: &ServerRegistry) -> String {
    registry
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

fn run_add(args: AddArgs, ctx: &Context) -> Result<()> {
    let mut registry = ctx.load_registry()?;
    if registry.contains(&args.name) {
        anyhow::bail!(
            "Server '{}' already exists. Use 'conduit servers remove {}' first.",
            args.name,
            args.name
        );
    }

    let descriptor = descriptor_from_args(&args)?;
    if ctx.verbose {
        println!("Adding server: {}", descriptor.name);
        println!("  Transport: {}", descriptor.transport);
        println!("  Target: {}", descriptor.target());
    }
    registry.add(descriptor)?;

    if ctx.json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "status": "added",
                "name": args.name,
                "config_path": saved_to(&registry),
            }))?
        );
    } else {
        println!("Added server: {}", args.name);
        println!("Config saved to: {}", saved_to(&registry));
        println!();
        println!("Test connection with:");
        println!("  conduit servers test {}", args.name);
    }
    Ok(())
}

fn run_remove(args: NameArgs, ctx: &Context) -> Result<()> {
    let mut registry = ctx.load_registry()?;
    registry.remove(&args.name)?;

    if ctx.json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "status": "removed",
                "name": args.name,
                "config_path": saved_to(&registry),
            }))?
        );
    } else {
        println!("Removed server: {}", args.name);
    }
    Ok(())
}

fn run_set_enabled(args: NameArgs, enabled: bool, ctx: &Context) -> Result<()> {
    let mut registry = ctx.load_registry()?;
    registry.set_enabled(&args.name, enabled)?;

    let status = if enabled { "enabled" } else { "disabled" };
    if ctx.json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "status": status, "name": args.name }))?
        );
    } else {
        println!("Server {}: {}", status, args.name);
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test
// ─────────────────────────────────────────────────────────────────────────────

async fn run_test(args: TestArgs, ctx: &Context) -> Result<()> {
    let registry = ctx.load_registry()?;
    let server = registry.get(&args.name).ok_or_else(|| {
        anyhow::anyhow!(
            "Server '{}' not found. Use 'conduit servers list' to see registered servers.",
            args.name
        )
    })?;

    if !ctx.json_output {
        println!("Testing connection to server: {}", server.name);
        println!("  Transport: {}", server.transport);
        println!("  Target: {}", server.target());
        println!();
    }

    match list_tools(server).await {
        Ok(tools) => {
            if ctx.json_output {
                let tools: Vec<_> = tools
                    .iter()
                    .map(|(name, schema)| {
                        if args.full {
                            json!({ "name": name, "input_schema": schema })
                        } else {
                            json!({ "name": name })
                        }
                    })
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "status": "ok",
                        "name": server.name,
                        "tools": tools,
                    }))?
                );
            } else {
                println!("Connected. {} tool(s):", tools.len());
                for (name, schema) in &tools {
                    println!("  - {}", name);
                    if args.full {
                        println!("    {}", serde_json::to_string_pretty(schema)?.replace('\n', "\n    "));
                    }
                }
            }
            Ok(())
        }
        Err(e) => {
            if ctx.json_output {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "status": "error",
                        "name": server.name,
                        "error": e.to_string(),
                    }))?
                );
                Ok(())
            } else {
                Err(e.context(format!("connection to '{}' failed", server.name)))
            }
        }
    }
}
