//! Transport adapters.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  AdapterSet                                                  │
//! │  TransportKind ──▶ Arc<dyn TransportAdapter>                 │
//! └──────────────────────────────────────────────────────────────┘
//!                           │ connect(descriptor, timeout)
//!                           ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  McpConnection<C: RpcChannel>   (Box<dyn Connection>)        │
//! │  handshake, tools/list paging, tools/call, status            │
//! └──────────────────────────────────────────────────────────────┘
//!          │                     │                      │
//!          ▼                     ▼                      ▼
//!   StdioChannel          HttpChannel             SseChannel
//!   child pipes,          POST + session id,      GET stream + POST
//!   per-conn mutex        JSON or SSE replies     endpoint, watchdog
//! ```
//!
//! Every adapter completes the MCP handshake (`initialize` followed by the
//! `notifications/initialized` notification) before returning a connection.

pub mod http;
pub mod sse;
pub mod stdio;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_config::{ServerDescriptor, TransportKind};
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{McpError, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ListToolsParams,
    ListToolsResult, ServerInfo, methods,
};
use crate::tool::{ConnectionStatus, ToolDescriptor};

pub use http::HttpAdapter;
pub use sse::SseAdapter;
pub use stdio::StdioAdapter;

/// Upper bound on `tools/list` pages followed for one server.
const MAX_TOOL_PAGES: usize = 32;

// ─────────────────────────────────────────────────────────────────────────────
// Public contract
// ─────────────────────────────────────────────────────────────────────────────

/// Opens connections for one transport kind.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// The transport this adapter serves.
    fn kind(&self) -> TransportKind;

    /// Establish a connection and complete the handshake within `timeout`.
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>>;
}

/// A live, initialized connection to one tool server.
///
/// All methods take `&self` so a connection can be shared behind an `Arc`
/// while invocations are in flight.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Name of the server this connection belongs to.
    fn server_name(&self) -> &str;

    /// Transport in use.
    fn transport(&self) -> TransportKind;

    /// Current status.
    fn status(&self) -> ConnectionStatus;

    /// Server identity reported during the handshake.
    fn server_info(&self) -> Option<ServerInfo> {
        None
    }

    /// Fetch the server's tool catalog.
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;

    /// Call a tool, bounded by `timeout`.
    ///
    /// A JSON-RPC error reply is returned as an error *result*, not an `Err`.
    async fn invoke(
        &self,
        tool: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<CallToolResult>;

    /// Release the connection. Calling it again is a no-op.
    async fn disconnect(&self) -> Result<()>;
}

/// Maps each transport kind to the adapter that serves it.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<TransportKind, Arc<dyn TransportAdapter>>,
}

impl AdapterSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// stdio, HTTP-streamable, and SSE adapters.
    pub fn standard() -> Self {
        Self::new()
            .with_adapter(Arc::new(StdioAdapter::new()))
            .with_adapter(Arc::new(HttpAdapter::new()))
            .with_adapter(Arc::new(SseAdapter::new()))
    }

    /// Register an adapter under its own kind.
    pub fn with_adapter(self, adapter: Arc<dyn TransportAdapter>) -> Self {
        let kind = adapter.kind();
        self.with_adapter_for(kind, adapter)
    }

    /// Register an adapter under an explicit kind.
    pub fn with_adapter_for(mut self, kind: TransportKind, adapter: Arc<dyn TransportAdapter>) -> Self {
        self.adapters.insert(kind, adapter);
        self
    }

    /// Adapter for a kind.
    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn TransportAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// Connect using the adapter for the descriptor's transport and its timeout.
    pub async fn connect(&self, descriptor: &ServerDescriptor) -> Result<Box<dyn Connection>> {
        let adapter = self
            .get(descriptor.transport)
            .ok_or_else(|| McpError::UnsupportedTransport(descriptor.transport.to_string()))?;
        adapter.connect(descriptor, descriptor.timeout()).await
    }
}

impl fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.adapters.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("AdapterSet").field("kinds", &kinds).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared JSON-RPC plumbing
// ─────────────────────────────────────────────────────────────────────────────

/// Raw request/notify primitive a transport provides.
#[async_trait]
pub(crate) trait RpcChannel: Send + Sync + 'static {
    /// Send a request and wait for the matching reply. A JSON-RPC error reply
    /// becomes [`McpError::ServerError`].
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value>;

    /// Send a notification.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Tear down the transport. Must be idempotent.
    async fn close(&self) -> Result<()>;

    /// Tear down after a failed handshake. Defaults to [`close`](Self::close).
    async fn abort(&self) -> Result<()> {
        self.close().await
    }

    /// A failure the transport noticed on its own (exited child, dead stream).
    fn failure(&self) -> Option<McpError> {
        None
    }
}

/// Run `fut` under `timeout`, mapping expiry to [`McpError::Timeout`].
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(McpError::Timeout(timeout)),
    }
}

/// Connection implementation shared by all transports.
pub(crate) struct McpConnection<C: RpcChannel> {
    name: String,
    transport: TransportKind,
    channel: C,
    status: Mutex<ConnectionStatus>,
    server_info: ServerInfo,
}

impl<C: RpcChannel> McpConnection<C> {
    /// Run the handshake on `channel` within `timeout`. On failure the channel
    /// is closed before the error is returned.
    pub(crate) async fn establish(
        name: &str,
        transport: TransportKind,
        channel: C,
        timeout: Duration,
    ) -> Result<Self> {
        match with_timeout(timeout, handshake(&channel)).await {
            Ok(init) => {
                tracing::info!(
                    server = %name,
                    transport = %transport,
                    peer = %init.server_info.name,
                    peer_version = %init.server_info.version,
                    protocol = %init.protocol_version,
                    "MCP server connected"
                );
                Ok(Self {
                    name: name.to_string(),
                    transport,
                    channel,
                    status: Mutex::new(ConnectionStatus::Connected),
                    server_info: init.server_info,
                })
            }
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "MCP handshake failed");
                if let Err(close_err) = channel.abort().await {
                    tracing::debug!(server = %name, error = %close_err, "close after failed handshake");
                }
                Err(e)
            }
        }
    }

    fn record(&self, err: &McpError) {
        if err.is_connection_error() || err.is_protocol_error() {
            *self.status.lock() = ConnectionStatus::Error;
        }
    }
}

async fn handshake<C: RpcChannel + ?Sized>(channel: &C) -> Result<InitializeResult> {
    let params = serde_json::to_value(InitializeParams::default())?;
    let value = channel.request(methods::INITIALIZE, Some(params)).await?;
    let init: InitializeResult = serde_json::from_value(value)
        .map_err(|e| McpError::protocol(format!("invalid initialize result: {}", e)))?;
    channel.notify(methods::INITIALIZED, None).await?;
    Ok(init)
}

#[async_trait]
impl<C: RpcChannel> Connection for McpConnection<C> {
    fn server_name(&self) -> &str {
        &self.name
    }

    fn transport(&self) -> TransportKind {
        self.transport
    }

    fn status(&self) -> ConnectionStatus {
        let mut status = self.status.lock();
        if *status == ConnectionStatus::Connected && self.channel.failure().is_some() {
            *status = ConnectionStatus::Error;
        }
        *status
    }

    fn server_info(&self) -> Option<ServerInfo> {
        Some(self.server_info.clone())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = serde_json::to_value(ListToolsParams {
                cursor: cursor.take(),
            })?;
            let page = match self.channel.request(methods::TOOLS_LIST, Some(params)).await {
                Ok(value) => serde_json::from_value::<ListToolsResult>(value)
                    .map_err(|e| McpError::protocol(format!("invalid tools/list result: {}", e))),
                Err(e) => Err(e),
            };
            let page = page.inspect_err(|e| self.record(e))?;

            tools.extend(
                page.tools
                    .into_iter()
                    .map(|info| ToolDescriptor::from_info(info, &self.name, self.transport)),
            );
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        tracing::debug!(server = %self.name, tool_count = tools.len(), "listed tools");
        Ok(tools)
    }

    async fn invoke(
        &self,
        tool: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<CallToolResult> {
        if let Some(err) = self.channel.failure() {
            *self.status.lock() = ConnectionStatus::Error;
            return Err(err);
        }

        let params = serde_json::to_value(CallToolParams {
            name: tool.to_string(),
            arguments,
        })?;

        tracing::debug!(server = %self.name, tool = %tool, "calling tool");
        let outcome = with_timeout(timeout, self.channel.request(methods::TOOLS_CALL, Some(params))).await;

        match outcome {
            Ok(value) => serde_json::from_value::<CallToolResult>(value).map_err(|e| {
                let err = McpError::protocol(format!("invalid tools/call result: {}", e));
                self.record(&err);
                err
            }),
            Err(McpError::ServerError { code, message, .. }) => {
                tracing::debug!(server = %self.name, tool = %tool, code, "tool call rejected by server");
                Ok(CallToolResult::error_result(format!(
                    "server error {}: {}",
                    code, message
                )))
            }
            Err(e) => {
                self.record(&e);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.status.lock(), ConnectionStatus::Disconnected);
        if previous == ConnectionStatus::Disconnected {
            return Ok(());
        }
        let result = self.channel.close().await;
        tracing::info!(server = %self.name, transport = %self.transport, "MCP server disconnected");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted channel for exercising the shared connection logic.
    struct ScriptedChannel {
        pages: Vec<Value>,
        list_calls: AtomicUsize,
        call_reply: Mutex<Option<Result<Value>>>,
        closes: AtomicUsize,
        failure: Mutex<Option<String>>,
    }

    impl ScriptedChannel {
        fn new(pages: Vec<Value>) -> Self {
            Self {
                pages,
                list_calls: AtomicUsize::new(0),
                call_reply: Mutex::new(None),
                closes: AtomicUsize::new(0),
                failure: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl RpcChannel for ScriptedChannel {
        async fn request(&self, method: &str, _params: Option<Value>) -> Result<Value> {
            match method {
                methods::INITIALIZE => Ok(serde_json::json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "scripted", "version": "0.1"}
                })),
                methods::TOOLS_LIST => {
                    let i = self.list_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(self.pages[i].clone())
                }
                methods::TOOLS_CALL => self
                    .call_reply
                    .lock()
                    .take()
                    .unwrap_or_else(|| Ok(serde_json::json!({"content": []}))),
                other => Err(McpError::protocol(format!("unexpected {other}"))),
            }
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn failure(&self) -> Option<McpError> {
            self.failure.lock().clone().map(McpError::ProcessExited)
        }
    }

    async fn connect(channel: ScriptedChannel) -> McpConnection<ScriptedChannel> {
        McpConnection::establish("alpha", TransportKind::Stdio, channel, Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor() {
        let conn = connect(ScriptedChannel::new(vec![
            serde_json::json!({"tools": [{"name": "a"}], "nextCursor": "2"}),
            serde_json::json!({"tools": [{"name": "b"}]}),
        ]))
        .await;

        let tools = conn.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(tools.iter().all(|t| t.server == "alpha"));
        assert_eq!(conn.server_info().unwrap().name, "scripted");
    }

    #[tokio::test]
    async fn test_server_error_becomes_error_result() {
        let channel = ScriptedChannel::new(vec![]);
        *channel.call_reply.lock() = Some(Err(McpError::server_error(-32602, "bad args", None)));
        let conn = connect(channel).await;

        let result = conn
            .invoke("a", None, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(result.is_error());
        assert!(result.text().contains("bad args"));
        assert_eq!(conn.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_connection_error_marks_status() {
        let channel = ScriptedChannel::new(vec![]);
        *channel.call_reply.lock() = Some(Err(McpError::ConnectionClosed));
        let conn = connect(channel).await;

        let err = conn.invoke("a", None, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed));
        assert_eq!(conn.status(), ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn test_failure_reported_by_channel() {
        let conn = connect(ScriptedChannel::new(vec![])).await;
        *conn.channel.failure.lock() = Some("exit status: 1".into());

        assert_eq!(conn.status(), ConnectionStatus::Error);
        let err = conn.invoke("a", None, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, McpError::ProcessExited(_)));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let conn = connect(ScriptedChannel::new(vec![])).await;
        conn.disconnect().await.unwrap();
        conn.disconnect().await.unwrap();
        assert_eq!(conn.channel.closes.load(Ordering::SeqCst), 1);
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_adapter_set_unsupported_kind() {
        let set = AdapterSet::new();
        let descriptor = ServerDescriptor::stdio("x", "x");
        let err = set.connect(&descriptor).await.err().unwrap();
        assert!(matches!(err, McpError::UnsupportedTransport(_)));
    }

    #[test]
    fn test_standard_set_has_all_kinds() {
        let set = AdapterSet::standard();
        for kind in [TransportKind::Stdio, TransportKind::Http, TransportKind::Sse] {
            assert_eq!(set.get(kind).unwrap().kind(), kind);
        }
    }
}
