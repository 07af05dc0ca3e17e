//! End-to-end tests for the SSE transport against an in-process axum server.
//!
//! The server opens an event stream on `GET /sse`, announces `/messages` as
//! the POST endpoint, and pushes each JSON-RPC reply back onto the stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::{Json, Router};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use conduit_config::ServerDescriptor;
use conduit_mcp::{Connection, ConnectionStatus, McpError, SseAdapter, TransportAdapter};
use futures::channel::mpsc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;

type EventSender = mpsc::UnboundedSender<Result<Event, Infallible>>;

#[derive(Clone, Default)]
struct ServerState {
    stream: Arc<Mutex<Option<EventSender>>>,
    methods: Arc<Mutex<Vec<String>>>,
    /// Stop answering requests.
    mute: Arc<AtomicBool>,
    /// Send keep-alive comments on the stream.
    keep_alive: Arc<AtomicBool>,
}

impl ServerState {
    fn push(&self, event: Event) {
        if let Some(tx) = self.stream.lock().as_ref() {
            let _ = tx.unbounded_send(Ok(event));
        }
    }

    fn push_json(&self, value: Value) {
        self.push(Event::default().event("message").data(value.to_string()));
    }

    fn stream_closed(&self) -> bool {
        self.stream.lock().as_ref().is_none_or(|tx| tx.is_closed())
    }
}

async fn open_stream(State(state): State<ServerState>) -> Response {
    let (tx, rx) = mpsc::unbounded();
    let _ = tx.unbounded_send(Ok(Event::default().event("endpoint").data("/messages")));
    *state.stream.lock() = Some(tx);

    let sse = Sse::new(rx);
    if state.keep_alive.load(Ordering::SeqCst) {
        sse.keep_alive(KeepAlive::new().interval(Duration::from_millis(100)))
            .into_response()
    } else {
        sse.into_response()
    }
}

async fn receive(State(state): State<ServerState>, Json(message): Json<Value>) -> StatusCode {
    let method = message["method"].as_str().unwrap_or_default().to_string();
    state.methods.lock().push(method.clone());

    let Some(id) = message.get("id").cloned() else {
        return StatusCode::ACCEPTED;
    };
    if state.mute.load(Ordering::SeqCst) {
        return StatusCode::ACCEPTED;
    }

    let result = match method.as_str() {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "sse-test-server", "version": "0.3.0"}
        }),
        "tools/list" => {
            // Noise first: a notification and a reply nobody is waiting for.
            state.push_json(json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {}}));
            state.push_json(json!({"jsonrpc": "2.0", "id": 9999, "result": {"tools": []}}));
            json!({"tools": [
                {"name": "echo", "description": "Echo back the input", "inputSchema": {"type": "object"}},
                {"name": "add", "description": "Add two numbers", "inputSchema": {"type": "object"}}
            ]})
        }
        "tools/call" => json!({
            "content": [{"type": "text", "text": message["params"]["arguments"]["message"]}]
        }),
        other => {
            state.push_json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": format!("Method not found: {other}")}
            }));
            return StatusCode::ACCEPTED;
        }
    };
    state.push_json(json!({"jsonrpc": "2.0", "id": id, "result": result}));
    StatusCode::ACCEPTED
}

/// Serve on an ephemeral port and return the stream URL.
async fn serve(state: ServerState) -> String {
    let app = Router::new()
        .route("/sse", get(open_stream))
        .route("/messages", post(receive))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/sse")
}

async fn connect(descriptor: &ServerDescriptor) -> Box<dyn Connection> {
    SseAdapter::new()
        .connect(descriptor, descriptor.timeout())
        .await
        .expect("SSE connect failed")
}

#[tokio::test]
async fn test_handshake_and_tool_listing() {
    let state = ServerState::default();
    let url = serve(state.clone()).await;
    let conn = connect(&ServerDescriptor::sse("remote", url).with_timeout_secs(5)).await;

    let info = conn.server_info().expect("server info");
    assert_eq!(info.name, "sse-test-server");
    assert_eq!(conn.status(), ConnectionStatus::Connected);

    let tools = conn.list_tools().await.unwrap();
    let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["echo", "add"]);
    assert_eq!(tools[0].server, "remote");

    let result = conn
        .invoke("echo", Some(json!({"message": "over sse"})), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result.text(), "over sse");

    assert_eq!(
        *state.methods.lock(),
        ["initialize", "notifications/initialized", "tools/list", "tools/call"]
    );
    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_silent_stream_fails_pending_request() {
    let state = ServerState::default();
    let url = serve(state.clone()).await;
    let descriptor = ServerDescriptor::sse("quiet", url)
        .with_timeout_secs(5)
        .with_heartbeat_secs(1);
    let conn = connect(&descriptor).await;

    state.mute.store(true, Ordering::SeqCst);
    let started = std::time::Instant::now();
    let err = conn
        .invoke("echo", Some(json!({"message": "lost"})), Duration::from_secs(10))
        .await
        .unwrap_err();

    // The watchdog fires well before the invocation deadline.
    assert!(matches!(err, McpError::ConnectionClosed), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(conn.status(), ConnectionStatus::Error);

    let err = conn.list_tools().await.unwrap_err();
    assert!(err.is_connection_error());
    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_closes_event_stream() {
    let state = ServerState::default();
    state.keep_alive.store(true, Ordering::SeqCst);
    let url = serve(state.clone()).await;
    let conn = connect(&ServerDescriptor::sse("remote", url).with_timeout_secs(5)).await;
    assert!(!state.stream_closed());

    conn.disconnect().await.unwrap();
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert!(matches!(
        conn.list_tools().await.unwrap_err(),
        McpError::ConnectionClosed
    ));

    // The server notices once its next keep-alive hits a closed socket.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while !state.stream_closed() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(closed.is_ok(), "event stream still open after disconnect");
    conn.disconnect().await.unwrap();
}
