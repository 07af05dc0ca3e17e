//! Session state and per-server status snapshots.

use std::fmt;

use conduit_config::TransportKind;
use conduit_mcp::ConnectionStatus;
use serde::Serialize;

/// Lifecycle state of a [`Session`](crate::Session).
///
/// ```text
/// Uninitialized ─enter()─▶ Connecting ─▶ Active ─exit()─▶ Closing ─▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Connecting,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        })
    }
}

/// Status of one server within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub transport: TransportKind,
    pub enabled: bool,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Tools in the server's own catalog, before collision resolution.
    pub tool_count: usize,
}

impl ServerStatus {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Per-server outcomes of [`Session::enter`](crate::Session::enter).
#[derive(Debug, Clone, Serialize)]
pub struct EnterReport {
    pub servers: Vec<ServerStatus>,
    /// Tools exposed after aggregation.
    pub tool_count: usize,
}

impl EnterReport {
    /// Servers that connected.
    pub fn connected(&self) -> impl Iterator<Item = &ServerStatus> {
        self.servers.iter().filter(|s| s.is_connected())
    }

    /// Enabled servers that failed to connect.
    pub fn failed(&self) -> impl Iterator<Item = &ServerStatus> {
        self.servers
            .iter()
            .filter(|s| s.enabled && s.status == ConnectionStatus::Error)
    }
}
