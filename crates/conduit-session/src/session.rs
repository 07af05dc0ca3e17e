//! Session lifecycle.
//!
//! A [`Session`] owns one connection per enabled server for the length of a
//! conversation. It connects everything once on [`enter`](Session::enter),
//! keeps the aggregated [`CapabilitySet`] current as servers come and go, and
//! releases every connection on [`exit`](Session::exit).
//!
//! Chat turns only read `Arc` snapshots (capabilities, connection handles),
//! so they never wait on the per-server locks that serialize
//! enable/disable/reconnect.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use conduit_config::{CollisionPolicy, ServerDescriptor, ServerRegistry, SessionSection};
use conduit_mcp::{AdapterSet, CallToolResult, Connection, ConnectionStatus, McpError, ToolDescriptor};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::aggregator::{CapabilitySet, aggregate};
use crate::error::{Result, SessionError};
use crate::status::{EnterReport, ServerStatus, SessionState};

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// Session behavior knobs.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub collision_policy: CollisionPolicy,
}

impl SessionOptions {
    pub fn from_section(section: &SessionSection) -> Self {
        Self {
            collision_policy: section.collision_policy,
        }
    }

    pub fn with_collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.collision_policy = policy;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server slots
// ─────────────────────────────────────────────────────────────────────────────

struct SlotState {
    enabled: bool,
    status: ConnectionStatus,
    last_error: Option<String>,
    connection: Option<Arc<dyn Connection>>,
    /// Bumped on every successful connect so a failed invocation only tears
    /// down the connection it ran on.
    generation: u64,
    tools: Vec<ToolDescriptor>,
}

struct ServerSlot {
    descriptor: ServerDescriptor,
    /// Serializes enable/disable/reconnect on this server.
    op_lock: tokio::sync::Mutex<()>,
    state: Mutex<SlotState>,
}

impl ServerSlot {
    fn new(descriptor: ServerDescriptor) -> Self {
        let enabled = descriptor.enabled;
        Self {
            descriptor,
            op_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(SlotState {
                enabled,
                status: ConnectionStatus::Disconnected,
                last_error: None,
                connection: None,
                generation: 0,
                tools: Vec::new(),
            }),
        }
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn status(&self) -> ServerStatus {
        let state = self.state.lock();
        ServerStatus {
            name: self.descriptor.name.clone(),
            transport: self.descriptor.transport,
            enabled: state.enabled,
            status: state.status,
            last_error: state.last_error.clone(),
            tool_count: state.tools.len(),
        }
    }

    /// Take the live connection, leaving the slot disconnected.
    fn take_connection(&self) -> Option<Arc<dyn Connection>> {
        let mut state = self.state.lock();
        state.tools.clear();
        if state.status != ConnectionStatus::Error {
            state.status = ConnectionStatus::Disconnected;
        }
        state.connection.take()
    }
}

async fn release(name: &str, connection: Arc<dyn Connection>) {
    match connection.disconnect().await {
        Ok(()) => info!(server = %name, "server disconnected"),
        Err(e) => warn!(server = %name, error = %e, "disconnect failed"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// Scoped set of live connections for one conversation.
pub struct Session {
    id: String,
    adapters: AdapterSet,
    options: SessionOptions,
    state: Mutex<SessionState>,
    entered_at: Mutex<Option<DateTime<Utc>>>,
    servers: Vec<Arc<ServerSlot>>,
    capabilities: RwLock<Arc<CapabilitySet>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("servers", &self.servers.len())
            .finish()
    }
}

impl Session {
    /// Create a session over `descriptors` (registry order). Nothing connects
    /// until [`enter`](Self::enter).
    pub fn new(descriptors: Vec<ServerDescriptor>, adapters: AdapterSet, options: SessionOptions) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            adapters,
            options,
            state: Mutex::new(SessionState::Uninitialized),
            entered_at: Mutex::new(None),
            servers: descriptors
                .into_iter()
                .map(|d| Arc::new(ServerSlot::new(d)))
                .collect(),
            capabilities: RwLock::new(Arc::new(CapabilitySet::empty())),
        }
    }

    /// Create a session over every descriptor in `registry`.
    pub fn from_registry(registry: &ServerRegistry, adapters: AdapterSet, options: SessionOptions) -> Self {
        Self::new(registry.descriptors(), adapters, options)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// When [`enter`](Self::enter) completed.
    pub fn entered_at(&self) -> Option<DateTime<Utc>> {
        *self.entered_at.lock()
    }

    /// Current capability set snapshot.
    pub fn capabilities(&self) -> Arc<CapabilitySet> {
        self.capabilities.read().clone()
    }

    /// Per-server status in registry order.
    pub fn status(&self) -> Vec<ServerStatus> {
        self.servers.iter().map(|slot| slot.status()).collect()
    }

    /// Status of one server.
    pub fn server_status(&self, name: &str) -> Result<ServerStatus> {
        Ok(self.slot(name)?.status())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Connect every enabled server once, concurrently.
    ///
    /// Individual failures are recorded in that server's status; the session
    /// becomes active even if nothing connected.
    pub async fn enter(&self) -> Result<EnterReport> {
        self.transition(SessionState::Uninitialized, SessionState::Connecting)?;
        info!(session = %self.id, servers = self.servers.len(), "entering session");

        let attempts = self
            .servers
            .iter()
            .filter(|slot| slot.state.lock().enabled)
            .map(|slot| async move {
                let _guard = slot.op_lock.lock().await;
                self.connect_slot(slot).await;
            });
        join_all(attempts).await;

        let caps = self.recompute();
        *self.entered_at.lock() = Some(Utc::now());
        self.set_state(SessionState::Active);

        let report = EnterReport {
            servers: self.status(),
            tool_count: caps.len(),
        };
        info!(
            session = %self.id,
            connected = report.connected().count(),
            failed = report.failed().count(),
            tool_count = report.tool_count,
            "session entered"
        );
        Ok(report)
    }

    /// Disconnect every server and close the session.
    ///
    /// Calling this on a closed session does nothing.
    pub async fn exit(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Closed => return Ok(()),
                SessionState::Active => *state = SessionState::Closing,
                actual => return Err(SessionError::invalid_state(SessionState::Active, actual)),
            }
        }
        info!(session = %self.id, "exiting session");

        let releases = self.servers.iter().map(|slot| async move {
            let _guard = slot.op_lock.lock().await;
            if let Some(connection) = slot.take_connection() {
                release(slot.name(), connection).await;
            }
            slot.state.lock().status = ConnectionStatus::Disconnected;
        });
        join_all(releases).await;

        *self.capabilities.write() = Arc::new(CapabilitySet::empty());
        self.set_state(SessionState::Closed);
        info!(session = %self.id, "session exited");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Runtime mutation
    // ─────────────────────────────────────────────────────────────────────

    /// Enable a disabled server and connect it. Enabling an enabled server is
    /// a no-op.
    pub async fn enable_server(&self, name: &str) -> Result<ServerStatus> {
        self.require_active()?;
        let slot = self.slot(name)?;
        let _guard = slot.op_lock.lock().await;

        if slot.state.lock().enabled {
            debug!(server = %name, "server already enabled");
            return Ok(slot.status());
        }

        slot.state.lock().enabled = true;
        info!(server = %name, "enabling server");
        self.connect_slot(&slot).await;
        self.recompute();
        Ok(slot.status())
    }

    /// Disconnect a server and mark it disabled.
    pub async fn disable_server(&self, name: &str) -> Result<ServerStatus> {
        self.require_active()?;
        let slot = self.slot(name)?;
        let _guard = slot.op_lock.lock().await;

        let connection = {
            let mut state = slot.state.lock();
            state.enabled = false;
            state.status = ConnectionStatus::Disconnected;
            state.last_error = None;
            state.tools.clear();
            state.connection.take()
        };
        // Drop the tools before the connection goes away.
        self.recompute();
        info!(server = %name, "server disabled");

        if let Some(connection) = connection {
            release(name, connection).await;
        }
        Ok(slot.status())
    }

    /// Drop and re-establish one server's connection.
    pub async fn reconnect_server(&self, name: &str) -> Result<ServerStatus> {
        self.require_active()?;
        let slot = self.slot(name)?;
        let _guard = slot.op_lock.lock().await;

        if !slot.state.lock().enabled {
            return Err(SessionError::Disabled(name.to_string()));
        }

        info!(server = %name, "reconnecting server");
        if let Some(connection) = slot.take_connection() {
            self.recompute();
            release(name, connection).await;
        }
        self.connect_slot(&slot).await;
        self.recompute();
        Ok(slot.status())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Invocation
    // ─────────────────────────────────────────────────────────────────────

    /// Invoke a tool by its exposed name.
    ///
    /// Tool-level failures come back as error results. A transport or
    /// protocol failure takes that server offline: it is marked `error`,
    /// disconnected, and its tools leave the capability set.
    pub async fn invoke_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        self.require_active()?;

        let caps = self.capabilities();
        let exposed = caps
            .resolve(name)
            .ok_or_else(|| SessionError::UnknownTool(name.to_string()))?;
        let server = exposed.descriptor.server.as_str();
        let tool = exposed.descriptor.name.as_str();

        let slot = self.slot(server)?;
        let (connection, generation) = {
            let state = slot.state.lock();
            match &state.connection {
                Some(conn) => (conn.clone(), state.generation),
                None => return Err(SessionError::NotConnected(server.to_string())),
            }
        };

        debug!(server = %server, tool = %tool, "invoking tool");
        match connection
            .invoke(tool, arguments, slot.descriptor.timeout())
            .await
        {
            Ok(result) => Ok(result),
            Err(e) if e.is_connection_error() || e.is_protocol_error() => {
                self.fail_server(&slot, generation, &e).await;
                Err(SessionError::Invocation {
                    server: server.to_string(),
                    tool: tool.to_string(),
                    source: e,
                })
            }
            Err(e) => Err(SessionError::Invocation {
                server: server.to_string(),
                tool: tool.to_string(),
                source: e,
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    fn slot(&self, name: &str) -> Result<Arc<ServerSlot>> {
        self.servers
            .iter()
            .find(|slot| slot.name() == name)
            .cloned()
            .ok_or_else(|| SessionError::UnknownServer(name.to_string()))
    }

    fn transition(&self, from: SessionState, to: SessionState) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(SessionError::invalid_state(from, *state));
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: SessionState) {
        *self.state.lock() = to;
    }

    fn require_active(&self) -> Result<()> {
        match self.state() {
            SessionState::Active => Ok(()),
            actual => Err(SessionError::invalid_state(SessionState::Active, actual)),
        }
    }

    /// One connect attempt. The caller holds the slot's op lock.
    async fn connect_slot(&self, slot: &ServerSlot) {
        let name = slot.name();
        slot.state.lock().status = ConnectionStatus::Connecting;

        let timeout = slot.descriptor.timeout();
        let outcome = match self.adapters.connect(&slot.descriptor).await {
            Ok(connection) => {
                let connection: Arc<dyn Connection> = Arc::from(connection);
                // The listing shares the connect deadline; a server that goes
                // quiet after initialize must not stall the whole session.
                let listed = match tokio::time::timeout(timeout, connection.list_tools()).await {
                    Ok(listed) => listed,
                    Err(_) => Err(McpError::Timeout(timeout)),
                };
                match listed {
                    Ok(tools) => Ok((connection, tools)),
                    Err(e) => {
                        if let Err(close) = connection.disconnect().await {
                            warn!(server = %name, error = %close, "disconnect after failed tool listing failed");
                        }
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        };

        let mut state = slot.state.lock();
        match outcome {
            Ok((connection, tools)) => {
                info!(
                    server = %name,
                    transport = %slot.descriptor.transport,
                    tool_count = tools.len(),
                    "server connected"
                );
                state.connection = Some(connection);
                state.generation += 1;
                state.status = ConnectionStatus::Connected;
                state.last_error = None;
                state.tools = tools;
            }
            Err(e) => {
                warn!(server = %name, error = %e, "server failed to connect");
                state.connection = None;
                state.status = ConnectionStatus::Error;
                state.last_error = Some(e.to_string());
                state.tools.clear();
            }
        }
    }

    /// Take a server offline after a fatal invocation error, unless it has
    /// been reconnected since the failing call started.
    async fn fail_server(&self, slot: &ServerSlot, generation: u64, error: &McpError) {
        let connection = {
            let mut state = slot.state.lock();
            if state.generation != generation || state.connection.is_none() {
                return;
            }
            state.status = ConnectionStatus::Error;
            state.last_error = Some(error.to_string());
            state.tools.clear();
            state.connection.take()
        };
        warn!(server = %slot.name(), error = %error, "server connection failed, taking it offline");
        self.recompute();

        if let Some(connection) = connection {
            release(slot.name(), connection).await;
        }
    }

    /// Rebuild the capability set from connected servers.
    fn recompute(&self) -> Arc<CapabilitySet> {
        // Hold the write lock while reading slots so concurrent recomputes
        // cannot publish out of order.
        let mut caps = self.capabilities.write();
        let catalogs: Vec<(String, Vec<ToolDescriptor>)> = self
            .servers
            .iter()
            .filter_map(|slot| {
                let state = slot.state.lock();
                (state.status == ConnectionStatus::Connected)
                    .then(|| (slot.descriptor.name.clone(), state.tools.clone()))
            })
            .collect();

        let set = Arc::new(aggregate(&catalogs, self.options.collision_policy));
        debug!(session = %self.id, tool_count = set.len(), "capability set recomputed");
        *caps = set.clone();
        set
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let state = *self.state.get_mut();
        if !matches!(state, SessionState::Active | SessionState::Connecting | SessionState::Closing) {
            return;
        }

        let connections: Vec<(String, Arc<dyn Connection>)> = self
            .servers
            .iter()
            .filter_map(|slot| slot.take_connection().map(|c| (slot.descriptor.name.clone(), c)))
            .collect();
        warn!(session = %self.id, state = %state, open = connections.len(), "session dropped without exit");

        if connections.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for (name, connection) in connections {
                        release(&name, connection).await;
                    }
                });
            }
            // Stdio children are kill-on-drop; dropping the handles is enough.
            Err(_) => drop(connections),
        }
    }
}
