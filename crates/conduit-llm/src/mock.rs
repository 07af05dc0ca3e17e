//! Mock backend for testing.
//!
//! Returns queued responses (or errors) in order, optionally falling back to a
//! repeated reply once the queue is empty. Every request is logged.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

use crate::backend::{LlmBackend, ResponseStream, response_events};
use crate::error::{LlmError, Result};
use crate::types::{CompletionRequest, CompletionResponse, ContentBlock, StopReason, Usage};

/// One scripted reply.
#[derive(Debug)]
pub enum MockResponse {
    Response(CompletionResponse),
    Error(LlmError),
}

/// A mock backend for testing purposes.
#[derive(Debug)]
pub struct MockBackend {
    name: String,
    queue: Mutex<VecDeque<MockResponse>>,
    fallback: Mutex<Option<CompletionResponse>>,
    delay: Mutex<Option<Duration>>,
    request_log: Mutex<Vec<CompletionRequest>>,
}

/// A plain text reply.
pub fn text_response(text: impl Into<String>) -> CompletionResponse {
    CompletionResponse::new(
        "mock_msg",
        "mock-model",
        vec![ContentBlock::text(text)],
        StopReason::EndTurn,
        Usage::new(10, 20),
    )
}

/// A reply asking for one tool call.
pub fn tool_use_response(
    id: impl Into<String>,
    name: impl Into<String>,
    input: serde_json::Value,
) -> CompletionResponse {
    CompletionResponse::new(
        "mock_msg",
        "mock-model",
        vec![ContentBlock::tool_use(id, name, input)],
        StopReason::ToolUse,
        Usage::new(10, 5),
    )
}

impl MockBackend {
    /// Create a new mock backend with the given responses.
    ///
    /// Responses are returned in order. If more requests are made than
    /// responses available and no fallback is set, an error is returned.
    pub fn new(responses: Vec<CompletionResponse>) -> Self {
        Self {
            name: "mock".to_string(),
            queue: Mutex::new(responses.into_iter().map(MockResponse::Response).collect()),
            fallback: Mutex::new(None),
            delay: Mutex::new(None),
            request_log: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock backend with a single text response.
    pub fn with_text(text: impl Into<String>) -> Self {
        Self::new(vec![text_response(text)])
    }

    /// Create a mock backend that answers every request with `text`.
    pub fn repeating(text: impl Into<String>) -> Self {
        let backend = Self::new(Vec::new());
        *backend.fallback.lock() = Some(text_response(text));
        backend
    }

    pub fn push_response(&self, response: CompletionResponse) {
        self.queue.lock().push_back(MockResponse::Response(response));
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.push_response(text_response(text));
    }

    pub fn push_error(&self, error: LlmError) {
        self.queue.lock().push_back(MockResponse::Error(error));
    }

    /// Delay every reply by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Get all requests that were made to this backend.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.request_log.lock().clone()
    }

    /// Get the number of requests made.
    pub fn request_count(&self) -> usize {
        self.request_log.lock().len()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.request_log.lock().last().cloned()
    }

    fn next_reply(&self) -> Result<CompletionResponse> {
        match self.queue.lock().pop_front() {
            Some(MockResponse::Response(response)) => Ok(response),
            Some(MockResponse::Error(error)) => Err(error),
            None => self.fallback.lock().clone().ok_or_else(|| {
                LlmError::Backend("MockBackend: no more responses available".to_string())
            }),
        }
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.request_log.lock().push(request);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.next_reply()
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<ResponseStream> {
        let response = self.complete(request).await?;
        let events = response_events(response).into_iter().map(Ok);
        Ok(Box::pin(futures::stream::iter(events)))
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
