//! In-memory transport adapter for tests.
//!
//! `MockAdapter` serves every transport kind. Each server name can be given a
//! tool catalog, made to fail on connect, or made to fail or stall on invoke.
//! Counters record how many connects, disconnects, and invocations happened
//! per server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_config::{ServerDescriptor, TransportKind};
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::error::{McpError, Result};
use crate::protocol::{CallToolResult, ServerInfo, ToolInfo};
use crate::tool::{ConnectionStatus, ToolDescriptor};
use crate::transport::{AdapterSet, Connection, TransportAdapter, with_timeout};

/// How a mock invocation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// The connection drops.
    ConnectionClosed,
    /// The server answers with garbage.
    Protocol,
    /// The tool reports an error result.
    ToolError,
}

#[derive(Debug, Clone, Default)]
struct ServerBehavior {
    tools: Vec<ToolInfo>,
    connect_error: Option<String>,
    invoke_failure: Option<MockFailure>,
    invoke_delay: Option<Duration>,
}

/// Per-server call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCounts {
    pub connects: usize,
    pub disconnects: usize,
    pub invocations: usize,
}

#[derive(Default)]
struct MockState {
    behaviors: HashMap<String, ServerBehavior>,
    counts: HashMap<String, MockCounts>,
}

/// Scriptable adapter shared by clones.
#[derive(Clone, Default)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `server` a catalog of tools named `names`.
    pub fn with_tools(self, server: &str, names: &[&str]) -> Self {
        self.set_tools(server, names);
        self
    }

    /// Replace the catalog of `server`.
    pub fn set_tools(&self, server: &str, names: &[&str]) {
        let tools = names
            .iter()
            .map(|name| ToolInfo {
                name: (*name).to_string(),
                description: Some(format!("{} from {}", name, server)),
                input_schema: Some(json!({"type": "object", "properties": {}})),
            })
            .collect();
        self.behavior(server, |b| b.tools = tools);
    }

    /// Make connects to `server` fail as if the command was missing.
    pub fn with_connect_failure(self, server: &str) -> Self {
        self.set_connect_failure(server, true);
        self
    }

    /// Toggle connect failure for `server`.
    pub fn set_connect_failure(&self, server: &str, fail: bool) {
        let error = fail.then(|| format!("failed to spawn '{}': No such file or directory", server));
        self.behavior(server, |b| b.connect_error = error);
    }

    /// Make invocations on `server` fail.
    pub fn set_invoke_failure(&self, server: &str, failure: Option<MockFailure>) {
        self.behavior(server, |b| b.invoke_failure = failure);
    }

    /// Make invocations on `server` take `delay` before answering.
    pub fn set_invoke_delay(&self, server: &str, delay: Option<Duration>) {
        self.behavior(server, |b| b.invoke_delay = delay);
    }

    /// Counters for `server`.
    pub fn counts(&self, server: &str) -> MockCounts {
        self.state.lock().counts.get(server).copied().unwrap_or_default()
    }

    pub fn connect_count(&self, server: &str) -> usize {
        self.counts(server).connects
    }

    pub fn disconnect_count(&self, server: &str) -> usize {
        self.counts(server).disconnects
    }

    pub fn invoke_count(&self, server: &str) -> usize {
        self.counts(server).invocations
    }

    /// An adapter set that routes every transport kind to this mock.
    pub fn adapter_set(&self) -> AdapterSet {
        let shared: Arc<dyn TransportAdapter> = Arc::new(self.clone());
        AdapterSet::new()
            .with_adapter_for(TransportKind::Stdio, shared.clone())
            .with_adapter_for(TransportKind::Http, shared.clone())
            .with_adapter_for(TransportKind::Sse, shared)
    }

    fn behavior(&self, server: &str, f: impl FnOnce(&mut ServerBehavior)) {
        let mut state = self.state.lock();
        f(state.behaviors.entry(server.to_string()).or_default());
    }

    fn count(&self, server: &str, f: impl FnOnce(&mut MockCounts)) {
        let mut state = self.state.lock();
        f(state.counts.entry(server.to_string()).or_default());
    }

    fn behavior_of(&self, server: &str) -> ServerBehavior {
        self.state
            .lock()
            .behaviors
            .get(server)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TransportAdapter for MockAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        _timeout: Duration,
    ) -> Result<Box<dyn Connection>> {
        self.count(&descriptor.name, |c| c.connects += 1);
        if let Some(error) = self.behavior_of(&descriptor.name).connect_error {
            return Err(McpError::SpawnFailed(error));
        }
        Ok(Box::new(MockConnection {
            name: descriptor.name.clone(),
            transport: descriptor.transport,
            adapter: self.clone(),
            status: Mutex::new(ConnectionStatus::Connected),
        }))
    }
}

struct MockConnection {
    name: String,
    transport: TransportKind,
    adapter: MockAdapter,
    status: Mutex<ConnectionStatus>,
}

#[async_trait]
impl Connection for MockConnection {
    fn server_name(&self) -> &str {
        &self.name
    }

    fn transport(&self) -> TransportKind {
        self.transport
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    fn server_info(&self) -> Option<ServerInfo> {
        Some(ServerInfo {
            name: format!("mock-{}", self.name),
            version: "0.0.0".to_string(),
        })
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        if *self.status.lock() != ConnectionStatus::Connected {
            return Err(McpError::ConnectionClosed);
        }
        Ok(self
            .adapter
            .behavior_of(&self.name)
            .tools
            .into_iter()
            .map(|info| ToolDescriptor::from_info(info, &self.name, self.transport))
            .collect())
    }

    async fn invoke(
        &self,
        tool: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<CallToolResult> {
        self.adapter.count(&self.name, |c| c.invocations += 1);
        if *self.status.lock() != ConnectionStatus::Connected {
            return Err(McpError::ConnectionClosed);
        }

        let behavior = self.adapter.behavior_of(&self.name);
        let outcome = with_timeout(timeout, async {
            if let Some(delay) = behavior.invoke_delay {
                tokio::time::sleep(delay).await;
            }
            match behavior.invoke_failure {
                Some(MockFailure::ConnectionClosed) => Err(McpError::ConnectionClosed),
                Some(MockFailure::Protocol) => Err(McpError::protocol("malformed reply")),
                Some(MockFailure::ToolError) => {
                    Ok(CallToolResult::error_result(format!("{} failed", tool)))
                }
                None => Ok(CallToolResult::text_result(format!(
                    "{}:{} {}",
                    self.name,
                    tool,
                    arguments.unwrap_or(Value::Null)
                ))),
            }
        })
        .await;

        if let Err(ref e) = outcome
            && (e.is_connection_error() || e.is_protocol_error())
        {
            *self.status.lock() = ConnectionStatus::Error;
        }
        outcome
    }

    async fn disconnect(&self) -> Result<()> {
        let previous =
            std::mem::replace(&mut *self.status.lock(), ConnectionStatus::Disconnected);
        if previous != ConnectionStatus::Disconnected {
            self.adapter.count(&self.name, |c| c.disconnects += 1);
        }
        Ok(())
    }
}
