//! REPL (Read-Eval-Print Loop) for interactive chat.

use std::io::Write;

use anyhow::Result;
use console::{Style, Term, style};
use futures::StreamExt;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};

use conduit_agent::{AgentRuntime, StreamChunk};
use conduit_session::ServerStatus;

use super::chat::cancel_on_ctrl_c;

/// REPL state.
pub struct Repl {
    agent: AgentRuntime,
    editor: Editor<(), DefaultHistory>,
    term: Term,
    verbose: bool,
}

/// Control flow for the REPL.
pub enum ControlFlow {
    Continue,
    Exit,
}

impl Repl {
    pub fn new(agent: AgentRuntime, verbose: bool) -> Result<Self> {
        let config = Config::builder()
            .history_ignore_space(true)
            .auto_add_history(true)
            .build();

        Ok(Self {
            agent,
            editor: Editor::with_config(config)?,
            term: Term::stdout(),
            verbose,
        })
    }

    /// Run until `/quit` or Ctrl+D.
    pub async fn run(&mut self) -> Result<()> {
        self.print_welcome();

        loop {
            let prompt = format!("{} ", style("conduit>").cyan().bold());
            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    if let Some(command) = line.strip_prefix('/') {
                        match self.handle_slash_command(command).await {
                            Ok(ControlFlow::Continue) => continue,
                            Ok(ControlFlow::Exit) => break,
                            Err(e) => {
                                self.print_error(&format!("Command error: {}", e));
                                continue;
                            }
                        }
                    }

                    if let Err(e) = self.send_message(line).await {
                        self.print_error(&e.to_string());
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!();
                    self.print_dim("(Interrupted - type /quit to exit)");
                }
                Err(ReadlineError::Eof) => {
                    println!();
                    break;
                }
                Err(e) => {
                    self.print_error(&format!("Input error: {}", e));
                    break;
                }
            }
        }

        self.print_dim("Goodbye!");
        Ok(())
    }

    /// Stream one turn. Ctrl+C cancels the turn, not the REPL.
    async fn send_message(&mut self, message: &str) -> Result<()> {
        let cancellation = cancel_on_ctrl_c();
        let mut stream = self.agent.chat_stream(message, cancellation.clone());

        while let Some(chunk) = stream.next().await {
            match chunk {
                StreamChunk::Text { content } => {
                    print!("{}", content);
                    std::io::stdout().flush()?;
                }
                StreamChunk::ToolStart { name, .. } => {
                    println!();
                    self.print_dim(&format!("[Running: {}]", name));
                }
                StreamChunk::ToolEnd { success, .. } => {
                    self.print_dim(&format!("[{}]", if success { "done" } else { "failed" }));
                }
                StreamChunk::Done { cached, usage, .. } => {
                    println!();
                    if self.verbose {
                        let source = if cached { "cache" } else { "model" };
                        self.print_dim(&format!(
                            "({} - {} in / {} out tokens)",
                            source, usage.input_tokens, usage.output_tokens
                        ));
                    }
                    println!();
                }
                StreamChunk::Error { message, .. } => {
                    println!();
                    self.print_error(&message);
                }
            }
        }
        cancellation.cancel();
        Ok(())
    }

    async fn handle_slash_command(&mut self, input: &str) -> Result<ControlFlow> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        let cmd = parts.first().copied().unwrap_or("");
        let arg = parts.get(1).copied();
        let session = self.agent.session().clone();

        match (cmd, arg) {
            ("quit" | "q" | "exit", _) => return Ok(ControlFlow::Exit),
            ("help" | "h" | "?", _) => self.print_help(),
            ("clear" | "cls", _) => self.term.clear_screen()?,
            ("reset", _) => {
                self.agent.clear_history().await;
                self.print_dim("Conversation cleared");
            }
            ("status", _) => {
                println!("Session {} ({})", session.id(), session.state());
                for server in session.status() {
                    print_server(&server);
                }
            }
            ("tools", _) => {
                let capabilities = session.capabilities();
                if capabilities.is_empty() {
                    self.print_dim("No tools available");
                }
                for tool in capabilities.tools() {
                    println!(
                        "  {} {}",
                        style(&tool.name).cyan(),
                        Style::new().dim().apply_to(format!("({})", tool.descriptor.server))
                    );
                }
            }
            ("enable", Some(name)) => print_server(&session.enable_server(name).await?),
            ("disable", Some(name)) => print_server(&session.disable_server(name).await?),
            ("reconnect", Some(name)) => print_server(&session.reconnect_server(name).await?),
            ("stats", _) => {
                let stats = self.agent.resilience().stats().await;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            ("enable" | "disable" | "reconnect", None) => {
                self.print_error(&format!("Usage: /{} <server>", cmd));
            }
            _ => {
                self.print_error(&format!("Unknown command: /{}", cmd));
                self.print_dim("Type /help for available commands");
            }
        }

        Ok(ControlFlow::Continue)
    }

    fn print_welcome(&self) {
        let dim = Style::new().dim();
        let session = self.agent.session();
        println!();
        println!("{}", style("Conduit Chat").bold().cyan());
        println!("{}", dim.apply_to("─".repeat(40)));
        println!(
            "{}",
            dim.apply_to(format!(
                "Model {} with {} tool(s).",
                self.agent.config().model,
                session.capabilities().len()
            ))
        );
        println!(
            "{}",
            dim.apply_to("Use /help for commands, Ctrl+D to exit.")
        );
        println!();
    }

    fn print_help(&self) {
        let dim = Style::new().dim();
        println!();
        println!("{}", style("Available Commands").bold());
        println!("{}", dim.apply_to("─".repeat(40)));
        println!("  {}  - Exit the REPL", style("/quit, /q").cyan());
        println!("  {}  - Show this help", style("/help, /h, /?").cyan());
        println!("  {}  - Clear the screen", style("/clear").cyan());
        println!("  {}  - Forget the conversation", style("/reset").cyan());
        println!("  {}  - Show server connections", style("/status").cyan());
        println!("  {}  - List exposed tools", style("/tools").cyan());
        println!("  {}  - Connect a server", style("/enable <server>").cyan());
        println!("  {}  - Disconnect a server", style("/disable <server>").cyan());
        println!("  {}  - Restart a server", style("/reconnect <server>").cyan());
        println!("  {}  - Breaker, cache and rate limit stats", style("/stats").cyan());
        println!();
        println!("{}", dim.apply_to("Keyboard shortcuts:"));
        println!("  {} - Cancel the current reply", dim.apply_to("Ctrl+C"));
        println!("  {} - Exit the REPL", dim.apply_to("Ctrl+D"));
        println!();
    }

    fn print_dim(&self, msg: &str) {
        println!("{}", Style::new().dim().apply_to(msg));
    }

    fn print_error(&self, msg: &str) {
        println!("{} {}", Style::new().red().apply_to("Error:"), msg);
    }
}

fn print_server(server: &ServerStatus) {
    let marker = if server.is_connected() {
        Style::new().green().apply_to("●")
    } else if server.enabled {
        Style::new().red().apply_to("●")
    } else {
        Style::new().dim().apply_to("○")
    };
    println!(
        "  {} {:<20} {:<6} {:<12} {} tool(s)",
        marker,
        server.name,
        server.transport.as_str(),
        server.status.to_string(),
        server.tool_count
    );
    if let Some(ref error) = server.last_error {
        println!("    {}", Style::new().dim().apply_to(error));
    }
}
