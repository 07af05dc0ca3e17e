//! HTTP-streamable transport.
//!
//! Each JSON-RPC message is a POST. The server may answer with a JSON body or
//! with a short SSE stream carrying the reply. The first response's
//! `Mcp-Session-Id` header is echoed on every later request, and `DELETE`
//! ends the session on disconnect.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conduit_config::{ServerDescriptor, TransportKind};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use url::Url;

use super::{Connection, McpConnection, RpcChannel, TransportAdapter};
use crate::error::{McpError, Result};
use crate::protocol::{Incoming, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, classify};

/// Session header defined by the streamable HTTP transport.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// Connects to tool servers over HTTP POST.
#[derive(Debug, Clone, Default)]
pub struct HttpAdapter;

impl HttpAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportAdapter for HttpAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>> {
        let url = parse_url(descriptor)?;
        let client = build_client(descriptor, timeout)?;

        tracing::debug!(server = %descriptor.name, url = %url, "opening HTTP transport");

        let channel = HttpChannel {
            server: descriptor.name.clone(),
            client,
            url,
            session_id: RwLock::new(None),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        };
        let connection =
            McpConnection::establish(&descriptor.name, TransportKind::Http, channel, timeout)
                .await?;
        Ok(Box::new(connection))
    }
}

/// Parse and check the descriptor URL.
pub(crate) fn parse_url(descriptor: &ServerDescriptor) -> Result<Url> {
    let raw = descriptor
        .url
        .as_deref()
        .ok_or_else(|| McpError::transport(format!("server '{}' has no URL", descriptor.name)))?;
    Url::parse(raw).map_err(|e| McpError::transport(format!("invalid URL '{}': {}", raw, e)))
}

/// HTTP client carrying the descriptor's headers on every request.
pub(crate) fn build_client(descriptor: &ServerDescriptor, timeout: Duration) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    for (key, value) in &descriptor.headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| McpError::transport(format!("invalid header name '{}': {}", key, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| McpError::transport(format!("invalid value for header '{}': {}", key, e)))?;
        headers.insert(name, value);
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(timeout)
        .pool_max_idle_per_host(5)
        .tcp_keepalive(Duration::from_secs(30))
        .build()
        .map_err(|e| McpError::transport(format!("failed to build HTTP client: {}", e)))
}

pub(crate) struct HttpChannel {
    server: String,
    client: reqwest::Client,
    url: Url,
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl HttpChannel {
    async fn post<T: Serialize + ?Sized>(&self, body: &T) -> Result<reqwest::Response> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::ConnectionClosed);
        }

        let session = self.session_id.read().clone();
        let mut request = self
            .client
            .post(self.url.clone())
            .header(ACCEPT, ACCEPT_BOTH)
            .json(body);
        if let Some(ref id) = session {
            request = request.header(SESSION_HEADER, id);
        }

        let response = request.send().await?;
        let status = response.status();

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = self.session_id.write();
            if current.as_deref() != Some(id) {
                tracing::debug!(server = %self.server, session = %id, "captured MCP session id");
                *current = Some(id.to_string());
            }
        }

        if status == StatusCode::NOT_FOUND && session.is_some() {
            return Err(McpError::SessionExpired);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Extract the reply for `id` from a JSON or SSE response body.
    async fn read_reply(&self, response: reqwest::Response, id: u64) -> Result<JsonRpcResponse> {
        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if !is_stream {
            let value: Value = response.json().await?;
            return match classify(value)? {
                Incoming::Response(reply) if reply.id == id => Ok(reply),
                Incoming::Response(reply) => Err(McpError::protocol(format!(
                    "response id {} does not match request id {}",
                    reply.id, id
                ))),
                _ => Err(McpError::protocol("expected a JSON-RPC response")),
            };
        }

        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| McpError::transport(format!("SSE error: {}", e)))?;
            if event.data.trim().is_empty() {
                continue;
            }
            match crate::protocol::parse_incoming(&event.data)? {
                Incoming::Response(reply) if reply.id == id => return Ok(reply),
                Incoming::Response(reply) => {
                    tracing::debug!(server = %self.server, received = reply.id, expected = id, "skipping unrelated response");
                }
                Incoming::Notification(note) => {
                    tracing::trace!(server = %self.server, method = %note.method, "skipping notification");
                }
                Incoming::Request { method, .. } => {
                    tracing::debug!(server = %self.server, method = %method, "ignoring server request");
                }
            }
        }
        Err(McpError::ConnectionClosed)
    }
}

#[async_trait]
impl RpcChannel for HttpChannel {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        tracing::trace!(server = %self.server, id, method, "sending HTTP request");

        let response = self.post(&request).await?;
        self.read_reply(response, id)
            .await?
            .into_result()
            .map_err(|e| McpError::server_error(e.code, e.message, e.data))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        self.post(&notification).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let session = self.session_id.write().take();
        let Some(session) = session else {
            return Ok(());
        };

        let result = self
            .client
            .delete(self.url.clone())
            .header(SESSION_HEADER, &session)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(server = %self.server, "MCP session terminated");
            }
            Ok(resp) if resp.status() == StatusCode::METHOD_NOT_ALLOWED => {
                tracing::warn!(server = %self.server, "server does not support session termination (405)");
            }
            Ok(resp) => {
                tracing::warn!(server = %self.server, status = %resp.status(), "session termination failed");
            }
            Err(e) => {
                tracing::warn!(server = %self.server, error = %e, "session termination request failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Replies with `result`, echoing the request id.
    struct RpcReply {
        result: Value,
        session: Option<&'static str>,
        sse: bool,
    }

    impl RpcReply {
        fn json(result: Value) -> Self {
            Self {
                result,
                session: None,
                sse: false,
            }
        }

        fn with_session(mut self, id: &'static str) -> Self {
            self.session = Some(id);
            self
        }

        fn as_sse(mut self) -> Self {
            self.sse = true;
            self
        }
    }

    impl Respond for RpcReply {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            let reply = json!({"jsonrpc": "2.0", "id": body["id"], "result": self.result});
            let mut template = if self.sse {
                let stream = format!(
                    "event: message\ndata: {{\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}}\n\nevent: message\ndata: {}\n\n",
                    reply
                );
                ResponseTemplate::new(200).set_body_raw(stream, "text/event-stream")
            } else {
                ResponseTemplate::new(200).set_body_json(reply)
            };
            if let Some(id) = self.session {
                template = template.insert_header(SESSION_HEADER, id);
            }
            template
        }
    }

    fn init_result() -> Value {
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "wiremock", "version": "1.0"}
        })
    }

    async fn mount_handshake(server: &MockServer) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "initialize"})))
            .respond_with(RpcReply::json(init_result()).with_session("sess-1"))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "notifications/initialized"})))
            .and(header(SESSION_HEADER, "sess-1"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(server)
            .await;
    }

    async fn connect(server: &MockServer) -> Box<dyn Connection> {
        let descriptor = ServerDescriptor::http("remote", format!("{}/mcp", server.uri()))
            .with_header("Authorization", "Bearer t0ken");
        HttpAdapter::new()
            .connect(&descriptor, Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_session_id_sent_after_capture() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .and(header(SESSION_HEADER, "sess-1"))
            .and(header("Authorization", "Bearer t0ken"))
            .respond_with(RpcReply::json(json!({"tools": [{"name": "search"}]})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(header(SESSION_HEADER, "sess-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let conn = connect(&server).await;
        assert_eq!(conn.server_info().unwrap().name, "wiremock");

        let tools = conn.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].transport, TransportKind::Http);

        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_sse_reply_body() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call"})))
            .respond_with(
                RpcReply::json(json!({"content": [{"type": "text", "text": "found 3"}]})).as_sse(),
            )
            .mount(&server)
            .await;

        let conn = connect(&server).await;
        let result = conn
            .invoke("search", Some(json!({"q": "rust"})), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.text(), "found 3");
    }

    #[tokio::test]
    async fn test_delete_405_is_not_fatal() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(405))
            .expect(1)
            .mount(&server)
            .await;

        let conn = connect(&server).await;
        conn.disconnect().await.unwrap();
        // Second disconnect does not issue another DELETE.
        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_404_with_session_is_expired() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let conn = connect(&server).await;
        let err = conn.list_tools().await.unwrap_err();
        assert!(matches!(err, McpError::SessionExpired));
        assert_eq!(conn.status(), crate::ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let descriptor = ServerDescriptor::http("remote", server.uri());
        let err = HttpAdapter::new()
            .connect(&descriptor, Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::Http { status: 500, ref body } if body == "boom"));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let descriptor =
            ServerDescriptor::http("remote", "http://localhost/mcp").with_header("bad header", "x");
        assert!(build_client(&descriptor, Duration::from_secs(1)).is_err());
    }
}
