//! Client-side MCP failures.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, McpError>;

/// Error type for MCP operations.
///
/// Variants fall into two groups. Connection errors mean the transport is no
/// longer usable; protocol errors mean the peer spoke something we could not
/// understand. Both are fatal to the connection they occurred on.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("failed to spawn MCP server: {0}")]
    SpawnFailed(String),

    /// Write or read on the underlying channel failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// JSON-RPC protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Server returned an error response.
    #[error("server error {code}: {message}")]
    ServerError {
        /// Error code from the server.
        code: i64,
        /// Error message from the server.
        message: String,
        /// Optional additional data.
        data: Option<serde_json::Value>,
    },

    /// EOF on stdout or the event stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server process exited.
    #[error("server process exited: {0}")]
    ProcessExited(String),

    /// No reply within the per-request deadline.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The server no longer recognizes our HTTP session.
    #[error("HTTP session expired")]
    SessionExpired,

    /// The handshake has not completed.
    #[error("server not initialized")]
    NotInitialized,

    /// No adapter registered for the requested transport.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),
}

impl McpError {
    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self::SpawnFailed(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn server_error(
        code: i64,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self::ServerError {
            code,
            message: message.into(),
            data,
        }
    }

    /// Whether the transport itself failed.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailed(_)
                | Self::Transport(_)
                | Self::Http { .. }
                | Self::Io(_)
                | Self::ConnectionClosed
                | Self::ProcessExited(_)
                | Self::Timeout(_)
                | Self::SessionExpired
                | Self::NotInitialized
        )
    }

    /// Whether the peer sent something malformed or refused the request.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::Json(_) | Self::ServerError { .. }
        )
    }

    /// Whether this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transport(format!("request timed out: {}", err))
        } else if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = McpError::spawn_failed("command not found");
        assert!(err.to_string().contains("spawn"));
        assert!(err.to_string().contains("command not found"));

        let err = McpError::server_error(-32600, "Invalid Request", None);
        assert!(err.to_string().contains("-32600"));
        assert!(err.to_string().contains("Invalid Request"));
    }

    #[test]
    fn test_classification() {
        assert!(McpError::ConnectionClosed.is_connection_error());
        assert!(McpError::ProcessExited("exit status: 1".into()).is_connection_error());
        assert!(McpError::Timeout(std::time::Duration::from_secs(1)).is_connection_error());
        assert!(McpError::SessionExpired.is_connection_error());
        assert!(!McpError::protocol("bad").is_connection_error());

        assert!(McpError::protocol("bad").is_protocol_error());
        assert!(McpError::server_error(-1, "x", None).is_protocol_error());
        assert!(!McpError::ConnectionClosed.is_protocol_error());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let mcp_err: McpError = json_err.into();
        assert!(matches!(mcp_err, McpError::Json(_)));
        assert!(mcp_err.is_protocol_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let mcp_err: McpError = io_err.into();
        assert!(matches!(mcp_err, McpError::Io(_)));
        assert!(mcp_err.is_connection_error());
    }
}
