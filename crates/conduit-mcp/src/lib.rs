//! MCP (Model Context Protocol) transport adapters for Conduit.
//!
//! Connects to tool servers over three transports and exposes them through one
//! contract:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  TransportAdapter::connect(descriptor, timeout)             │
//! │    stdio  - child process, newline or Content-Length framing│
//! │    http   - POST per message, Mcp-Session-Id correlation    │
//! │    sse    - event stream for replies, POST endpoint         │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Connection                                                 │
//! │    list_tools / invoke / disconnect / status                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use conduit_config::ServerDescriptor;
//! use conduit_mcp::AdapterSet;
//!
//! let adapters = AdapterSet::standard();
//! let descriptor = ServerDescriptor::stdio("sqlite", "mcp-server-sqlite")
//!     .with_args(["--db", "/path/to/database.db"]);
//!
//! let conn = adapters.connect(&descriptor).await?;
//! for tool in conn.list_tools().await? {
//!     println!("{} - {}", tool.name, tool.description);
//! }
//! let result = conn
//!     .invoke("query", Some(json!({"sql": "SELECT 1"})), descriptor.timeout())
//!     .await?;
//! println!("{}", result.text());
//! conn.disconnect().await?;
//! ```
//!
//! The protocol flow on every transport is:
//! 1. Client sends `initialize` with capabilities
//! 2. Server responds with its capabilities
//! 3. Client sends `notifications/initialized`
//! 4. Client can now call `tools/list` and `tools/call`

pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod mock;
pub mod protocol;
pub mod tool;
pub mod transport;

pub use error::{McpError, Result};
#[cfg(any(test, feature = "testing"))]
pub use mock::{MockAdapter, MockCounts, MockFailure};
pub use protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult, ServerCapabilities,
    ServerInfo, ToolContent, ToolInfo, ToolsCapability,
};
pub use tool::{ConnectionStatus, ToolDescriptor};
pub use transport::{
    AdapterSet, Connection, HttpAdapter, SseAdapter, StdioAdapter, TransportAdapter,
};
