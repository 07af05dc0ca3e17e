//! Error types for session operations.

use conduit_mcp::McpError;
use thiserror::Error;

use crate::status::SessionState;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Error type for session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The operation is not allowed in the session's current state.
    #[error("session is {actual}, expected {expected}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    /// No descriptor with this name belongs to the session.
    #[error("unknown server: {0}")]
    UnknownServer(String),

    /// The server is disabled.
    #[error("server '{0}' is disabled")]
    Disabled(String),

    /// No tool with this name is in the capability set.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// The owning server has no live connection.
    #[error("server '{0}' is not connected")]
    NotConnected(String),

    /// Invoking a tool failed at the transport or protocol level.
    #[error("tool '{tool}' on server '{server}' failed: {source}")]
    Invocation {
        server: String,
        tool: String,
        #[source]
        source: McpError,
    },
}

impl SessionError {
    pub fn invalid_state(expected: SessionState, actual: SessionState) -> Self {
        Self::InvalidState { expected, actual }
    }

    /// Whether the failure took the owning server's connection down.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Self::Invocation { source, .. } => {
                source.is_connection_error() || source.is_protocol_error()
            }
            Self::NotConnected(_) => true,
            _ => false,
        }
    }
}
