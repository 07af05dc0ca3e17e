//! Stdio transport: a local child process speaking JSON-RPC over its pipes.
//!
//! Exchanges on one connection are serialized by a mutex over the pipes. A
//! request abandoned mid-flight (timeout, cancellation) may leave its reply in
//! the pipe; the next request skips any response whose id is not its own.
//!
//! Reads go through [`FrameReader`], whose buffer outlives a dropped read, so
//! an abandoned request never leaves a half-consumed frame behind. A write
//! dropped part way cannot be repaired and fails the connection instead.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conduit_config::{Framing, ServerDescriptor, TransportKind};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::{Connection, McpConnection, RpcChannel, TransportAdapter};
use crate::error::{McpError, Result};
use crate::protocol::{Incoming, JsonRpcNotification, JsonRpcRequest, parse_incoming};

/// How long a terminated child gets to exit before it is killed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Spawns tool servers as child processes.
#[derive(Debug, Clone)]
pub struct StdioAdapter {
    grace: Duration,
}

impl Default for StdioAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioAdapter {
    pub fn new() -> Self {
        Self {
            grace: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Set the SIGTERM grace period used on disconnect.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[async_trait]
impl TransportAdapter for StdioAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>> {
        let command = descriptor
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| McpError::spawn_failed("no command configured"))?;

        let mut cmd = Command::new(command);
        cmd.args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::spawn_failed(format!("failed to spawn '{}': {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::spawn_failed("failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::spawn_failed("failed to capture stdout"))?;

        tracing::debug!(
            server = %descriptor.name,
            command = %command,
            pid = child.id().unwrap_or(0),
            framing = ?descriptor.framing,
            "spawned MCP server process"
        );

        let channel = StdioChannel {
            server: descriptor.name.clone(),
            framing: descriptor.framing,
            pipes: tokio::sync::Mutex::new(Pipes {
                stdin,
                stdout: FrameReader::new(BufReader::new(stdout), descriptor.framing),
            }),
            child: parking_lot::Mutex::new(Some(child)),
            next_id: AtomicU64::new(1),
            torn: AtomicBool::new(false),
            grace: self.grace,
        };

        let connection =
            McpConnection::establish(&descriptor.name, TransportKind::Stdio, channel, timeout)
                .await?;
        Ok(Box::new(connection))
    }
}

struct Pipes {
    stdin: ChildStdin,
    stdout: FrameReader<BufReader<ChildStdout>>,
}

pub(crate) struct StdioChannel {
    server: String,
    framing: Framing,
    pipes: tokio::sync::Mutex<Pipes>,
    child: parking_lot::Mutex<Option<Child>>,
    next_id: AtomicU64,
    /// Set when a write stopped part way through a frame.
    torn: AtomicBool,
    grace: Duration,
}

impl StdioChannel {
    fn take_child(&self) -> Option<Child> {
        self.child.lock().take()
    }

    async fn send(&self, stdin: &mut ChildStdin, json: &str) -> Result<()> {
        let guard = WriteGuard {
            torn: &self.torn,
            finished: false,
        };
        write_message(stdin, self.framing, json).await?;
        guard.finish();
        Ok(())
    }
}

/// Marks the channel torn unless the write it covers ran to completion.
struct WriteGuard<'a> {
    torn: &'a AtomicBool,
    finished: bool,
}

impl WriteGuard<'_> {
    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.torn.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl RpcChannel for StdioChannel {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if let Some(err) = self.failure() {
            return Err(err);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let json = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        let mut pipes = self.pipes.lock().await;
        self.send(&mut pipes.stdin, &json).await?;
        tracing::trace!(server = %self.server, id, method, "sent request");

        loop {
            let Some(text) = pipes.stdout.next_message().await? else {
                return Err(McpError::ConnectionClosed);
            };

            match parse_incoming(&text)? {
                Incoming::Response(response) if response.id == id => {
                    return response
                        .into_result()
                        .map_err(|e| McpError::server_error(e.code, e.message, e.data));
                }
                Incoming::Response(response) => {
                    tracing::debug!(
                        server = %self.server,
                        expected = id,
                        received = response.id,
                        "discarding stale response"
                    );
                }
                Incoming::Notification(note) => {
                    tracing::trace!(server = %self.server, method = %note.method, "skipping notification");
                }
                Incoming::Request { method, .. } => {
                    tracing::debug!(server = %self.server, method = %method, "ignoring server request");
                }
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if let Some(err) = self.failure() {
            return Err(err);
        }
        let json = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        let mut pipes = self.pipes.lock().await;
        self.send(&mut pipes.stdin, &json).await
    }

    async fn close(&self) -> Result<()> {
        let child = self.take_child();
        let Some(mut child) = child else {
            return Ok(());
        };
        terminate(&self.server, &mut child, self.grace).await
    }

    async fn abort(&self) -> Result<()> {
        let child = self.take_child();
        let Some(mut child) = child else {
            return Ok(());
        };
        child.kill().await?;
        tracing::debug!(server = %self.server, "killed MCP server process");
        Ok(())
    }

    fn failure(&self) -> Option<McpError> {
        if self.torn.load(Ordering::SeqCst) {
            return Some(McpError::transport("write abandoned mid-frame, pipe out of sync"));
        }
        let mut guard = self.child.lock();
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(McpError::ProcessExited(status.to_string())),
            Ok(None) => None,
            Err(e) => Some(McpError::Io(e)),
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate(server: &str, child: &mut Child, grace: Duration) -> Result<()> {
    if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!(server = %server, %status, "MCP server process already exited");
        return Ok(());
    }

    let pid = child.id().unwrap_or(0);

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if pid > 0 {
            #[allow(clippy::cast_possible_wrap)]
            let target = Pid::from_raw(pid as i32);
            if let Err(e) = kill(target, Signal::SIGTERM) {
                tracing::debug!(server = %server, pid, error = %e, "SIGTERM failed");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(server = %server, pid, %status, "MCP server process terminated");
        }
        Ok(Err(e)) => {
            tracing::warn!(server = %server, pid, error = %e, "error waiting for MCP server process");
        }
        Err(_) => {
            tracing::warn!(
                server = %server,
                pid,
                grace_ms = grace.as_millis() as u64,
                "MCP server process did not exit after SIGTERM, killing"
            );
            child.kill().await?;
        }
    }
    Ok(())
}

async fn write_message(stdin: &mut ChildStdin, framing: Framing, json: &str) -> Result<()> {
    match framing {
        Framing::Newline => {
            stdin.write_all(json.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }
        Framing::ContentLength => {
            let header = format!("Content-Length: {}\r\n\r\n", json.len());
            stdin.write_all(header.as_bytes()).await?;
            stdin.write_all(json.as_bytes()).await?;
        }
    }
    stdin.flush().await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Framing
// ─────────────────────────────────────────────────────────────────────────────

/// Splits a byte stream into messages.
///
/// Bytes are moved into `buf` as soon as they arrive and a frame is removed
/// only once it is complete, so dropping [`next_message`](Self::next_message)
/// at its await point loses nothing.
struct FrameReader<R> {
    inner: R,
    framing: Framing,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    fn new(inner: R, framing: Framing) -> Self {
        Self {
            inner,
            framing,
            buf: Vec::new(),
        }
    }

    /// Next message. `None` on EOF.
    async fn next_message(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(message) = self.take_frame()? {
                return Ok(Some(message));
            }
            let chunk = self.inner.fill_buf().await?;
            if chunk.is_empty() {
                return Ok(self.take_trailing());
            }
            let n = chunk.len();
            self.buf.extend_from_slice(chunk);
            self.inner.consume(n);
        }
    }

    fn take_frame(&mut self) -> Result<Option<String>> {
        match self.framing {
            Framing::Newline => Ok(self.take_line()),
            Framing::ContentLength => self.take_content_length(),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        while let Some(end) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=end).collect();
            if let Some(message) = json_line(&line) {
                return Some(message);
            }
        }
        None
    }

    fn take_content_length(&mut self) -> Result<Option<String>> {
        let mut pos = 0;
        let mut content_length: Option<usize> = None;

        let length = loop {
            let Some(end) = self.buf[pos..].iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };
            let line = String::from_utf8_lossy(&self.buf[pos..pos + end]).trim().to_string();
            pos += end + 1;

            if line.is_empty() {
                match content_length {
                    Some(length) => break length,
                    None => continue,
                }
            }
            if let Some((name, value)) = line.split_once(':')
                && name.trim().eq_ignore_ascii_case("content-length")
            {
                match value.trim().parse() {
                    Ok(length) => content_length = Some(length),
                    Err(e) => {
                        self.buf.drain(..pos);
                        return Err(McpError::protocol(format!("invalid Content-Length: {}", e)));
                    }
                }
            }
        };

        if self.buf.len() < pos + length {
            return Ok(None);
        }
        let body: Vec<u8> = self.buf.drain(..pos + length).skip(pos).collect();
        String::from_utf8(body)
            .map(Some)
            .map_err(|e| McpError::protocol(format!("invalid UTF-8 in message: {}", e)))
    }

    /// A final unterminated line at EOF still counts in newline framing.
    fn take_trailing(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        match self.framing {
            Framing::Newline => json_line(&rest),
            Framing::ContentLength => None,
        }
    }
}

/// Servers sometimes log to stdout; only JSON objects are messages.
fn json_line(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed.starts_with('{') {
        tracing::debug!(line = %trimmed, "ignoring non-JSON output");
        return None;
    }
    Some(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_newline_skips_noise() {
        let input = b"starting up...\n\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n";
        let mut reader = FrameReader::new(&input[..], Framing::Newline);
        let msg = reader.next_message().await.unwrap();
        assert_eq!(msg.as_deref(), Some(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#));
        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_newline_unterminated_last_line() {
        let input = b"{\"id\":1}\n{\"id\":2}";
        let mut reader = FrameReader::new(&input[..], Framing::Newline);
        assert_eq!(reader.next_message().await.unwrap().as_deref(), Some(r#"{"id":1}"#));
        assert_eq!(reader.next_message().await.unwrap().as_deref(), Some(r#"{"id":2}"#));
        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_content_length() {
        let body = r#"{"jsonrpc":"2.0","id":2,"result":{}}"#;
        let input = format!(
            "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n{}content-length: 2\r\n\r\n{{}}",
            body.len(),
            body
        );
        let mut reader = FrameReader::new(input.as_bytes(), Framing::ContentLength);
        assert_eq!(reader.next_message().await.unwrap().as_deref(), Some(body));
        assert_eq!(reader.next_message().await.unwrap().as_deref(), Some("{}"));
        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_content_length_invalid_header() {
        let input = b"Content-Length: abc\r\n\r\n{}";
        let mut reader = FrameReader::new(&input[..], Framing::ContentLength);
        let err = reader.next_message().await.unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_dropped_mid_frame_resumes() {
        let body = r#"{"jsonrpc":"2.0","id":7,"result":{"tools":[]}}"#;
        let (mut server, client) = tokio::io::duplex(256);
        let mut reader = FrameReader::new(BufReader::new(client), Framing::ContentLength);

        // Header and half the body arrive, then the reader is abandoned.
        let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        let split = frame.len() - body.len() / 2;
        server.write_all(&frame.as_bytes()[..split]).await.unwrap();
        let abandoned = tokio::time::timeout(Duration::from_millis(50), reader.next_message()).await;
        assert!(abandoned.is_err());

        server.write_all(&frame.as_bytes()[split..]).await.unwrap();
        server.write_all(b"Content-Length: 2\r\n\r\n{}").await.unwrap();
        assert_eq!(reader.next_message().await.unwrap().as_deref(), Some(body));
        assert_eq!(reader.next_message().await.unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn test_dropped_write_tears_channel() {
        let torn = AtomicBool::new(false);
        WriteGuard {
            torn: &torn,
            finished: false,
        }
        .finish();
        assert!(!torn.load(Ordering::SeqCst));

        drop(WriteGuard {
            torn: &torn,
            finished: false,
        });
        assert!(torn.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_command() {
        let descriptor = ServerDescriptor::stdio("ghost", "nonexistent-mcp-server-12345");
        let err = StdioAdapter::new()
            .connect(&descriptor, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::SpawnFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handshake_timeout_kills_child() {
        // `cat` echoes our request back, which is not a response, so the
        // handshake never completes.
        let descriptor = ServerDescriptor::stdio("echo", "cat");
        let err = StdioAdapter::new()
            .connect(&descriptor, Duration::from_millis(200))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::Timeout(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_is_connection_closed() {
        let descriptor = ServerDescriptor::stdio("quitter", "true");
        let err = StdioAdapter::new()
            .connect(&descriptor, Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        assert!(err.is_connection_error());
    }
}
