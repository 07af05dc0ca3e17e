//! Tool server descriptors.
//!
//! A descriptor is pure configuration: how to reach one tool server and whether
//! it should be connected. Live connection state is owned elsewhere.
//!
//! ```toml
//! [[servers]]
//! name = "sqlite"
//! command = "mcp-server-sqlite"
//! args = ["--db", "${DATA_DIR:-/var/lib/conduit}/app.db"]
//! env = { LOG_LEVEL = "info" }
//!
//! [[servers]]
//! name = "search"
//! transport = "http"
//! url = "https://tools.example.com/mcp"
//! headers = { Authorization = "Bearer ${SEARCH_TOKEN}" }
//! timeout_secs = 10
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env;
use crate::error::{ConfigError, Result};

/// Default per-operation timeout for connect and invoke.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default SSE silence window before the peer is considered dead.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 45;

/// Transport used to reach a tool server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Local subprocess speaking over stdin/stdout.
    #[default]
    Stdio,
    /// Request/response over HTTP, correlated by a session token.
    Http,
    /// Long-lived server-sent event stream.
    Sse,
}

impl TransportKind {
    /// Lowercase name, matching the config spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "http" => Ok(Self::Http),
            "sse" => Ok(Self::Sse),
            other => Err(ConfigError::invalid(
                "transport",
                "server descriptor",
                format!("unknown transport '{}' (expected stdio, http or sse)", other),
            )),
        }
    }
}

/// Message framing on a stdio pipe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// One JSON message per line.
    #[default]
    Newline,
    /// `Content-Length: N` header block followed by the body.
    ContentLength,
}

/// Configuration for a single tool server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerDescriptor {
    /// Unique name within a registry.
    pub name: String,
    /// Transport kind. Defaults to stdio.
    #[serde(default)]
    pub transport: TransportKind,
    /// Command to spawn (stdio).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments for the command (stdio).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment for the child process (stdio).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Pipe framing (stdio).
    #[serde(default)]
    pub framing: Framing,
    /// Endpoint URL (http, sse).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Extra request headers (http, sse).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Silence window for the SSE keep-alive watchdog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_secs: Option<u64>,
    /// Whether the server should be connected when a session starts.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Timeout for connect and each tool invocation.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl ServerDescriptor {
    /// Create a stdio descriptor.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Stdio,
            command: Some(command.into()),
            args: Vec::new(),
            env: BTreeMap::new(),
            framing: Framing::default(),
            url: None,
            headers: BTreeMap::new(),
            heartbeat_secs: None,
            enabled: true,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Create an HTTP-streamable descriptor.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Http,
            command: None,
            url: Some(url.into()),
            ..Self::stdio(name, "")
        }
    }

    /// Create an SSE descriptor.
    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Sse,
            ..Self::http(name, url)
        }
    }

    /// Add an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Replace the argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable for the child process.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a request header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set the pipe framing.
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Set the operation timeout in seconds.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set the SSE heartbeat window in seconds.
    pub fn with_heartbeat_secs(mut self, secs: u64) -> Self {
        self.heartbeat_secs = Some(secs);
        self
    }

    /// Set the enabled flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Operation timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// SSE heartbeat window.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.unwrap_or(DEFAULT_HEARTBEAT_SECS))
    }

    /// Return a copy with every string field passed through variable substitution.
    pub fn expanded(&self) -> Self {
        self.expanded_with(|name| std::env::var(name).ok())
    }

    /// Like [`expanded`](Self::expanded) with a custom variable lookup.
    pub fn expanded_with<F>(&self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let sub = |s: &str| env::substitute_with(s, &lookup);
        Self {
            name: self.name.clone(),
            transport: self.transport,
            command: self.command.as_deref().map(sub),
            args: self.args.iter().map(|a| sub(a)).collect(),
            env: self.env.iter().map(|(k, v)| (k.clone(), sub(v))).collect(),
            framing: self.framing,
            url: self.url.as_deref().map(sub),
            headers: self.headers.iter().map(|(k, v)| (k.clone(), sub(v))).collect(),
            heartbeat_secs: self.heartbeat_secs,
            enabled: self.enabled,
            timeout_secs: self.timeout_secs,
        }
    }

    /// Check that the fields required by the declared transport are present.
    pub fn validate(&self) -> Result<()> {
        let context = format!("server '{}'", self.name);

        if self.name.trim().is_empty() {
            return Err(ConfigError::missing("name", "server descriptor"));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "timeout_secs",
                context,
                "must be greater than zero",
            ));
        }

        match self.transport {
            TransportKind::Stdio => {
                let has_command = self
                    .command
                    .as_deref()
                    .is_some_and(|c| !c.trim().is_empty());
                if !has_command {
                    return Err(ConfigError::missing("command", context));
                }
            }
            TransportKind::Http | TransportKind::Sse => {
                let raw = self
                    .url
                    .as_deref()
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| ConfigError::missing("url", context.clone()))?;
                let parsed = url::Url::parse(raw)
                    .map_err(|e| ConfigError::invalid("url", context.clone(), e.to_string()))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(ConfigError::invalid(
                        "url",
                        context,
                        format!("unsupported scheme '{}'", parsed.scheme()),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Short human-readable target: the command line or the URL.
    pub fn target(&self) -> String {
        match self.transport {
            TransportKind::Stdio => {
                let mut parts = vec![self.command.clone().unwrap_or_default()];
                parts.extend(self.args.iter().cloned());
                parts.join(" ")
            }
            TransportKind::Http | TransportKind::Sse => self.url.clone().unwrap_or_default(),
        }
    }
}
