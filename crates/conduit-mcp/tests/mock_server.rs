//! Mock MCP server for integration testing.
//!
//! Responds to initialize, tools/list, and tools/call. The framing is detected
//! from the first message: a line starting with `{` selects newline framing,
//! anything else Content-Length framing. Replies use the same framing.
//!
//! Usage:
//!   mock-mcp-server [--delay-ms N] [--crash-on TOOL] [--slow-tool TOOL:MS] [--noisy]
//!
//! Options:
//!   --delay-ms N       Add N ms delay to all responses
//!   --crash-on TOOL    Exit with code 1 when TOOL is called
//!   --slow-tool T:MS   Add MS delay when tool T is called
//!   --noisy            Emit a notification and a stale response before each tool reply

#![allow(dead_code)]

use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    #[serde(default)]
    id: Option<u64>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Framing {
    Newline,
    ContentLength,
}

struct ServerConfig {
    delay_ms: u64,
    crash_on: Option<String>,
    slow_tools: Vec<(String, u64)>,
    noisy: bool,
}

impl ServerConfig {
    fn from_args() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut config = Self {
            delay_ms: 0,
            crash_on: None,
            slow_tools: Vec::new(),
            noisy: false,
        };

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--delay-ms" if i + 1 < args.len() => {
                    config.delay_ms = args[i + 1].parse().unwrap_or(0);
                    i += 2;
                }
                "--crash-on" if i + 1 < args.len() => {
                    config.crash_on = Some(args[i + 1].clone());
                    i += 2;
                }
                "--slow-tool" if i + 1 < args.len() => {
                    if let Some((tool, ms)) = args[i + 1].split_once(':')
                        && let Ok(ms) = ms.parse()
                    {
                        config.slow_tools.push((tool.to_string(), ms));
                    }
                    i += 2;
                }
                "--noisy" => {
                    config.noisy = true;
                    i += 1;
                }
                _ => i += 1,
            }
        }
        config
    }

    fn tool_delay(&self, tool_name: &str) -> u64 {
        self.slow_tools
            .iter()
            .find(|(tool, _)| tool == tool_name)
            .map(|(_, ms)| *ms)
            .unwrap_or(0)
    }
}

fn main() {
    let config = ServerConfig::from_args();
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut framing: Option<Framing> = None;

    while let Some((body, detected)) = read_message(&mut reader, framing) {
        framing = Some(detected);

        let request: JsonRpcRequest = match serde_json::from_str(&body) {
            Ok(req) => req,
            Err(_) => continue,
        };
        // Notifications get no reply.
        let Some(id) = request.id else {
            continue;
        };

        if config.delay_ms > 0 {
            thread::sleep(Duration::from_millis(config.delay_ms));
        }

        if config.noisy && request.method == "tools/call" {
            let note = json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"level": "info"}});
            write_message(&mut stdout, detected, &note.to_string());
            let stale = json!({"jsonrpc": "2.0", "id": id + 1000, "result": {"content": []}});
            write_message(&mut stdout, detected, &stale.to_string());
        }

        let response = handle_request(id, &request, &config);
        let response_json = serde_json::to_string(&response).unwrap();
        write_message(&mut stdout, detected, &response_json);
    }
}

fn read_message(reader: &mut impl BufRead, framing: Option<Framing>) -> Option<(String, Framing)> {
    let mut line = String::new();
    let mut content_length: Option<usize> = None;

    loop {
        line.clear();
        if reader.read_line(&mut line).unwrap() == 0 {
            return None;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if let Some(len) = content_length {
                let mut body = vec![0u8; len];
                reader.read_exact(&mut body).unwrap();
                return Some((String::from_utf8(body).unwrap(), Framing::ContentLength));
            }
            continue;
        }
        if framing != Some(Framing::ContentLength) && trimmed.starts_with('{') {
            return Some((trimmed.to_string(), Framing::Newline));
        }
        if let Some(len_str) = trimmed.strip_prefix("Content-Length:") {
            content_length = Some(len_str.trim().parse().unwrap());
        }
    }
}

fn write_message(stdout: &mut impl Write, framing: Framing, json: &str) {
    match framing {
        Framing::Newline => writeln!(stdout, "{}", json).unwrap(),
        Framing::ContentLength => {
            write!(stdout, "Content-Length: {}\r\n\r\n{}", json.len(), json).unwrap()
        }
    }
    stdout.flush().unwrap();
}

fn handle_request(id: u64, request: &JsonRpcRequest, config: &ServerConfig) -> JsonRpcResponse {
    let result = match request.method.as_str() {
        "initialize" => Some(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "mock-mcp-server", "version": "1.0.0" }
        })),
        "tools/list" => Some(json!({
            "tools": [
                {
                    "name": "echo",
                    "description": "Echo back the input",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "message": { "type": "string" } },
                        "required": ["message"]
                    }
                },
                {
                    "name": "add",
                    "description": "Add two numbers",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "a": { "type": "number" }, "b": { "type": "number" } },
                        "required": ["a", "b"]
                    }
                },
                {
                    "name": "slow",
                    "description": "A slow tool for testing timeouts",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "delay_ms": { "type": "number" } }
                    }
                },
                {
                    "name": "crash",
                    "description": "Crashes the server (for testing)",
                    "inputSchema": { "type": "object", "properties": {} }
                }
            ]
        })),
        "tools/call" => {
            let params = request.params.clone().unwrap_or(json!({}));
            let tool_name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let args = params.get("arguments").cloned().unwrap_or(json!({}));

            if config.crash_on.as_deref() == Some(tool_name) {
                std::process::exit(1);
            }

            let tool_delay = config.tool_delay(tool_name);
            if tool_delay > 0 {
                thread::sleep(Duration::from_millis(tool_delay));
            }

            match tool_name {
                "echo" => {
                    let message = args.get("message").and_then(|v| v.as_str()).unwrap_or("");
                    Some(json!({ "content": [ { "type": "text", "text": message } ] }))
                }
                "add" => {
                    let a = args.get("a").and_then(|v| v.as_f64()).unwrap_or(0.0);
                    let b = args.get("b").and_then(|v| v.as_f64()).unwrap_or(0.0);
                    Some(json!({ "content": [ { "type": "text", "text": format!("{}", a + b) } ] }))
                }
                "slow" => {
                    let delay = args.get("delay_ms").and_then(|v| v.as_u64()).unwrap_or(1000);
                    thread::sleep(Duration::from_millis(delay));
                    Some(json!({
                        "content": [ { "type": "text", "text": format!("Slept for {} ms", delay) } ]
                    }))
                }
                "crash" => std::process::exit(1),
                _ => Some(json!({
                    "content": [ { "type": "text", "text": format!("Unknown tool: {}", tool_name) } ],
                    "isError": true
                })),
            }
        }
        _ => None,
    };

    let error = result.is_none().then(|| {
        json!({
            "code": -32601,
            "message": format!("Method not found: {}", request.method)
        })
    });

    JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id,
        result,
        error,
    }
}
