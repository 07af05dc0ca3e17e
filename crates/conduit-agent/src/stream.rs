//! Streaming turns.
//!
//! A streamed turn follows the same steps as a blocking one (cache, admission,
//! breaker and retry, tool dispatch, cache population) but yields
//! [`StreamChunk`]s as it goes. Cancellation is checked between events and
//! raced against tool invocations.

use std::pin::Pin;
use std::sync::Arc;

use conduit_llm::{ContentDelta, LlmError, Message, StreamAccumulator, StreamEvent, Usage};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{AgentError, ErrorKind};
use crate::runtime::{RuntimeInner, result_block};

// ─────────────────────────────────────────────────────────────────────────────
// Stream Chunk
// ─────────────────────────────────────────────────────────────────────────────

/// A chunk emitted during a streamed turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Text content being streamed.
    Text {
        /// The text delta.
        content: String,
    },
    /// A tool is starting execution.
    ToolStart {
        /// Tool call ID.
        id: String,
        /// Name of the tool being called.
        name: String,
    },
    /// A tool has finished execution.
    ToolEnd {
        /// Tool call ID.
        id: String,
        /// Whether the tool succeeded.
        success: bool,
        /// Result content.
        content: String,
    },
    /// The turn is complete.
    Done {
        /// LLM calls made.
        iterations: u32,
        /// Whether the answer came from the cache.
        cached: bool,
        usage: Usage,
    },
    /// The turn failed. Nothing follows.
    Error {
        /// What went wrong, for callers that branch on it.
        kind: ErrorKind,
        /// Error message.
        message: String,
        /// Suggested wait before retrying (circuit open, rate limited).
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
}

impl StreamChunk {
    /// Create a text chunk.
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// Create a tool start chunk.
    pub fn tool_start(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ToolStart {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Create a tool end chunk.
    pub fn tool_end(id: impl Into<String>, success: bool, content: impl Into<String>) -> Self {
        Self::ToolEnd {
            id: id.into(),
            success,
            content: content.into(),
        }
    }

    /// Create a done chunk.
    pub fn done(iterations: u32, cached: bool, usage: Usage) -> Self {
        Self::Done {
            iterations,
            cached,
            usage,
        }
    }

    /// Create an error chunk.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

impl From<AgentError> for StreamChunk {
    fn from(e: AgentError) -> Self {
        Self::Error {
            kind: e.kind(),
            message: e.to_string(),
            retry_after_ms: e.retry_after().map(|d| d.as_millis() as u64),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Turn Stream
// ─────────────────────────────────────────────────────────────────────────────

/// A boxed stream of chunks.
pub type AgentStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send + 'static>>;

pub(crate) fn create_turn_stream(
    inner: Arc<RuntimeInner>,
    message: String,
    cancellation: CancellationToken,
) -> AgentStream {
    Box::pin(async_stream::stream! {
        if let Err(e) = inner.require_active() {
            yield StreamChunk::from(e);
            return;
        }

        let mut history = inner.history.lock().await;
        let session_id = inner.session.id().to_string();
        info!(session = %session_id, message_len = message.len(), streaming = true, "turn started");

        let key = inner.turn_key(&message);
        if let Some(text) = inner.cached_answer(&key).await {
            history.push(Message::user(message.as_str()));
            history.push(Message::assistant(text.clone()));
            info!(session = %session_id, cached = true, "turn completed");
            yield StreamChunk::text(text);
            yield StreamChunk::done(0, true, Usage::default());
            return;
        }

        if let Err(e) = inner.admit().await {
            yield StreamChunk::from(e);
            return;
        }

        let mut messages = history.clone();
        messages.push(Message::user(message.as_str()));
        let mut usage = Usage::default();
        let mut tool_call_count = 0usize;
        let mut iterations = 0u32;
        let mut consistent = true;

        loop {
            if cancellation.is_cancelled() {
                yield StreamChunk::from(AgentError::Cancelled);
                return;
            }

            iterations += 1;
            if iterations > inner.config.max_iterations {
                warn!(session = %session_id, iterations, "max iterations exceeded");
                yield StreamChunk::from(AgentError::MaxIterations(inner.config.max_iterations));
                return;
            }

            let capabilities = inner.session.capabilities();
            consistent &= key.matches(&capabilities);
            let request = inner.build_request(&messages, &capabilities).with_streaming();

            let opened = tokio::select! {
                biased;
                _ = cancellation.cancelled() => None,
                opened = inner.open_stream(request) => Some(opened),
            };
            let (mut events, permit) = match opened {
                None => {
                    yield StreamChunk::from(AgentError::Cancelled);
                    return;
                }
                Some(Err(e)) => {
                    yield StreamChunk::from(e);
                    return;
                }
                Some(Ok(pair)) => pair,
            };

            let mut accumulator = StreamAccumulator::new();
            let mut failure: Option<AgentError> = None;
            let mut cancelled = false;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => None,
                    item = events.next() => Some(item),
                };
                let event = match next {
                    None => {
                        cancelled = true;
                        break;
                    }
                    Some(None) => break,
                    Some(Some(Err(e))) => {
                        failure = Some(AgentError::Llm(e));
                        break;
                    }
                    Some(Some(Ok(event))) => event,
                };

                accumulator.push(&event);
                match event {
                    StreamEvent::ContentBlockDelta {
                        delta: ContentDelta::TextDelta(text),
                        ..
                    } => {
                        yield StreamChunk::text(text);
                    }
                    StreamEvent::Error { message } => {
                        failure = Some(AgentError::Llm(LlmError::Backend(message)));
                        break;
                    }
                    StreamEvent::MessageStop => break,
                    _ => {}
                }
            }

            if cancelled {
                // An abandoned permit counts as neither success nor failure.
                drop(permit);
                yield StreamChunk::from(AgentError::Cancelled);
                return;
            }
            if let Some(e) = failure {
                permit.failure();
                warn!(session = %session_id, error = %e, "LLM stream failed");
                yield StreamChunk::from(e);
                return;
            }
            permit.success();

            let response = match accumulator.finish() {
                Ok(response) => response,
                Err(e) => {
                    yield StreamChunk::from(AgentError::from(e));
                    return;
                }
            };
            usage.add(response.usage);

            if response.has_tool_use() {
                let mut results = Vec::new();
                for tool_use in response.tool_uses() {
                    yield StreamChunk::tool_start(tool_use.id.as_str(), tool_use.name.as_str());

                    let dispatched = tokio::select! {
                        biased;
                        _ = cancellation.cancelled() => None,
                        record = inner.dispatch(&tool_use) => Some(record),
                    };
                    let record = match dispatched {
                        Some(record) => record,
                        None => {
                            yield StreamChunk::from(AgentError::Cancelled);
                            return;
                        }
                    };

                    yield StreamChunk::tool_end(record.id.as_str(), record.success, record.content.as_str());
                    results.push(result_block(&record));
                    tool_call_count += 1;
                }
                messages.push(Message::assistant_blocks(response.content));
                messages.push(Message::tool_results(results));
                continue;
            }

            let text = response.text();
            messages.push(Message::assistant(text.clone()));
            *history = messages;
            inner.remember(&key, &text, consistent).await;

            info!(
                session = %session_id,
                iterations,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                tool_calls = tool_call_count,
                "turn completed"
            );
            yield StreamChunk::done(iterations, false, usage);
            return;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_serialization() {
        let json = serde_json::to_value(StreamChunk::tool_end("t1", true, "ok")).unwrap();
        assert_eq!(json["type"], "tool_end");
        assert_eq!(json["success"], true);

        let done = StreamChunk::done(2, false, Usage::new(1, 2));
        assert!(done.is_terminal());
        assert!(!StreamChunk::text("x").is_terminal());
    }

    #[test]
    fn test_error_chunk_from_agent_error() {
        let chunk = StreamChunk::from(AgentError::Cancelled);
        assert_eq!(chunk, StreamChunk::error(ErrorKind::Cancelled, "Task cancelled"));

        let chunk = StreamChunk::from(AgentError::RateLimitExceeded {
            retry_after: Some(std::time::Duration::from_millis(250)),
        });
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "rate_limited");
        assert_eq!(json["retry_after_ms"], 250);

        let json = serde_json::to_value(StreamChunk::from(AgentError::MaxIterations(2))).unwrap();
        assert_eq!(json["kind"], "max_iterations");
        assert!(json.get("retry_after_ms").is_none());
    }
}
