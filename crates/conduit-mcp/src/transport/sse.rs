//! SSE transport: a long-lived event stream for replies, POSTs for requests.
//!
//! ```text
//!   GET  url ───────────▶  event: endpoint   data: /messages?session=..
//!                          event: message    data: {"id":1,"result":..}
//!                          : keep-alive
//!   POST endpoint ──────▶  202 Accepted      (reply arrives on the stream)
//! ```
//!
//! A reader task routes each `message` event to the request waiting on its id.
//! A watchdog fails the connection when no bytes arrive for the heartbeat
//! window.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conduit_config::{ServerDescriptor, TransportKind};
use eventsource_stream::{Event, Eventsource};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use reqwest::header::ACCEPT;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::http::{build_client, parse_url};
use super::{Connection, McpConnection, RpcChannel, TransportAdapter, with_timeout};
use crate::error::{McpError, Result};
use crate::protocol::{Incoming, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, parse_incoming};

type EventStream = Pin<Box<dyn Stream<Item = std::result::Result<Event, String>> + Send>>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Connects to tool servers over a server-sent event stream.
#[derive(Debug, Clone, Default)]
pub struct SseAdapter;

impl SseAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportAdapter for SseAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>> {
        let url = parse_url(descriptor)?;
        let client = build_client(descriptor, timeout)?;
        let heartbeat = descriptor.heartbeat();

        let (events, endpoint, last_seen) = with_timeout(timeout, async {
            let response = client
                .get(url.clone())
                .header(ACCEPT, "text/event-stream")
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(McpError::Http {
                    status: status.as_u16(),
                    body,
                });
            }

            let last_seen = Arc::new(Mutex::new(Instant::now()));
            let mut events = event_stream(response.bytes_stream(), last_seen.clone());
            let endpoint = discover_endpoint(&mut events, &url).await?;
            Ok((events, endpoint, last_seen))
        })
        .await?;

        tracing::debug!(
            server = %descriptor.name,
            url = %url,
            endpoint = %endpoint,
            heartbeat_secs = heartbeat.as_secs(),
            "SSE stream open"
        );

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let failed = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let reader = tokio::spawn(read_events(ReaderContext {
            server: descriptor.name.clone(),
            events,
            pending: pending.clone(),
            last_seen,
            heartbeat,
            cancel: cancel.clone(),
            failed: failed.clone(),
        }));

        let channel = SseChannel {
            server: descriptor.name.clone(),
            client,
            endpoint,
            pending,
            next_id: AtomicU64::new(1),
            cancel,
            failed,
            closed: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
        };

        let connection =
            McpConnection::establish(&descriptor.name, TransportKind::Sse, channel, timeout)
                .await?;
        Ok(Box::new(connection))
    }
}

/// Parse raw stream bytes into events, stamping `last_seen` on every chunk,
/// keep-alive comments included.
fn event_stream<S, B, E>(bytes: S, last_seen: Arc<Mutex<Instant>>) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    Box::pin(
        bytes
            .inspect(move |_| *last_seen.lock() = Instant::now())
            .eventsource()
            .map(|item| item.map_err(|e| e.to_string())),
    )
}

/// Wait for the `endpoint` event and resolve it against the stream URL.
async fn discover_endpoint(events: &mut EventStream, base: &Url) -> Result<Url> {
    while let Some(event) = events.next().await {
        let event = event.map_err(McpError::transport)?;
        if event.event == "endpoint" {
            return resolve_endpoint(base, &event.data);
        }
        tracing::trace!(event = %event.event, "skipping event before endpoint");
    }
    Err(McpError::protocol("event stream ended before the endpoint event"))
}

fn resolve_endpoint(base: &Url, data: &str) -> Result<Url> {
    base.join(data.trim())
        .map_err(|e| McpError::protocol(format!("invalid endpoint '{}': {}", data.trim(), e)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader task
// ─────────────────────────────────────────────────────────────────────────────

struct ReaderContext {
    server: String,
    events: EventStream,
    pending: Pending,
    last_seen: Arc<Mutex<Instant>>,
    heartbeat: Duration,
    cancel: CancellationToken,
    failed: Arc<Mutex<Option<String>>>,
}

async fn read_events(mut ctx: ReaderContext) {
    let check_every = (ctx.heartbeat / 4).max(Duration::from_millis(250));
    let mut ticker = tokio::time::interval(check_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break None,
            event = ctx.events.next() => match event {
                Some(Ok(event)) => dispatch(&ctx.server, &ctx.pending, event),
                Some(Err(e)) => break Some(format!("event stream error: {}", e)),
                None => break Some("event stream ended".to_string()),
            },
            _ = ticker.tick() => {
                let silent = ctx.last_seen.lock().elapsed();
                if silent > ctx.heartbeat {
                    break Some(format!("no data for {}s", silent.as_secs()));
                }
            }
        }
    };

    if let Some(reason) = reason {
        tracing::warn!(server = %ctx.server, reason = %reason, "SSE connection lost");
        *ctx.failed.lock() = Some(reason);
    }
    // Dropping the senders fails every waiting request.
    ctx.pending.lock().clear();
}

fn dispatch(server: &str, pending: &Pending, event: Event) {
    if !(event.event.is_empty() || event.event == "message") {
        tracing::trace!(server = %server, event = %event.event, "ignoring event");
        return;
    }
    if event.data.trim().is_empty() {
        return;
    }

    match parse_incoming(&event.data) {
        Ok(Incoming::Response(response)) => {
            let waiter = pending.lock().remove(&response.id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => {
                    tracing::debug!(server = %server, id = response.id, "discarding response with no waiter");
                }
            }
        }
        Ok(Incoming::Notification(note)) => {
            tracing::trace!(server = %server, method = %note.method, "skipping notification");
        }
        Ok(Incoming::Request { method, .. }) => {
            tracing::debug!(server = %server, method = %method, "ignoring server request");
        }
        Err(e) => {
            tracing::warn!(server = %server, error = %e, "unparsable SSE message");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Channel
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct SseChannel {
    server: String,
    client: reqwest::Client,
    endpoint: Url,
    pending: Pending,
    next_id: AtomicU64,
    cancel: CancellationToken,
    failed: Arc<Mutex<Option<String>>>,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Removes a waiter when its request is abandoned.
struct WaiterGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

impl SseChannel {
    async fn post(&self, body: &impl serde::Serialize) -> Result<()> {
        let response = self.client.post(self.endpoint.clone()).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RpcChannel for SseChannel {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if let Some(err) = self.failure() {
            return Err(err);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _guard = WaiterGuard {
            pending: &self.pending,
            id,
        };
        // The reader may have failed between the check above and the insert,
        // after it last cleared the waiters.
        if let Some(err) = self.failure() {
            return Err(err);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::ConnectionClosed);
        }

        tracing::trace!(server = %self.server, id, method, "posting SSE request");
        self.post(&JsonRpcRequest::new(id, method, params)).await?;

        let response = rx.await.map_err(|_| McpError::ConnectionClosed)?;
        response
            .into_result()
            .map_err(|e| McpError::server_error(e.code, e.message, e.data))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.post(&JsonRpcNotification::new(method, params)).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        let reader = self.reader.lock().take();
        if let Some(handle) = reader
            && let Err(e) = handle.await
        {
            tracing::debug!(server = %self.server, error = %e, "SSE reader task ended abnormally");
        }
        self.pending.lock().clear();
        Ok(())
    }

    fn failure(&self) -> Option<McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.failed
            .lock()
            .as_ref()
            .map(|_| McpError::ConnectionClosed)
    }
}

impl Drop for SseChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
