//! The agent runtime.
//!
//! [`AgentRuntime`] runs chat turns for one entered [`Session`]. A turn is:
//!
//! 1. cache lookup by [`Fingerprint`] (a hit returns without touching the
//!    model or the rate limiter)
//! 2. rate-limit admission
//! 3. the tool loop: LLM call through breaker and retry, tool dispatch
//!    through the session, repeat until the model answers in text
//! 4. cache population, skipped when the tool configuration changed while
//!    the turn ran
//!
//! Turns on one runtime are serialized by the history lock.

use std::sync::Arc;

use conduit_llm::{
    CompletionRequest, CompletionResponse, ContentBlock, LlmError, Message, ResponseStream,
    SharedBackend, ToolUseBlock, Usage,
};
use conduit_resilience::{CircuitError, Fingerprint, Permit, ResilienceLayer, normalize};
use conduit_session::{CapabilitySet, Session};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};
use crate::stream::{AgentStream, create_turn_stream};
use crate::types::{AgentConfig, ChatResponse, ToolCallRecord, tool_definitions};

// ─────────────────────────────────────────────────────────────────────────────
// Shared turn helpers
// ─────────────────────────────────────────────────────────────────────────────

/// State shared by blocking and streaming turns.
pub(crate) struct RuntimeInner {
    pub(crate) backend: SharedBackend,
    pub(crate) session: Arc<Session>,
    pub(crate) resilience: Arc<ResilienceLayer>,
    pub(crate) config: AgentConfig,
    pub(crate) history: tokio::sync::Mutex<Vec<Message>>,
}

/// Cache key and label for one user message.
pub(crate) struct TurnKey {
    pub(crate) fingerprint: Fingerprint,
    pub(crate) label: String,
    /// Capability signature the fingerprint was computed under.
    signature: String,
}

impl TurnKey {
    pub(crate) fn matches(&self, capabilities: &CapabilitySet) -> bool {
        capabilities.signature() == self.signature
    }
}

impl RuntimeInner {
    pub(crate) fn require_active(&self) -> Result<()> {
        if self.session.is_active() {
            Ok(())
        } else {
            Err(AgentError::SessionNotActive)
        }
    }

    pub(crate) fn turn_key(&self, message: &str) -> TurnKey {
        let capabilities = self.session.capabilities();
        TurnKey {
            fingerprint: Fingerprint::compute(
                message,
                self.config.read_only,
                capabilities.signature(),
                &self.config.model,
            ),
            label: normalize(message),
            signature: capabilities.signature().to_string(),
        }
    }

    pub(crate) async fn cached_answer(&self, key: &TurnKey) -> Option<String> {
        let hit = self.resilience.cache.get(key.fingerprint.as_str()).await;
        if hit.is_some() {
            debug!(fingerprint = %key.fingerprint, "answer served from cache");
        }
        hit
    }

    /// Cache an answer under `key`. `consistent` is false when some LLM call
    /// of the turn saw a different tool configuration than the key.
    pub(crate) async fn remember(&self, key: &TurnKey, text: &str, consistent: bool) {
        if !consistent || !key.matches(&self.session.capabilities()) {
            debug!(
                fingerprint = %key.fingerprint,
                "tool configuration changed during turn, answer not cached"
            );
            return;
        }
        self.resilience
            .cache
            .insert(key.fingerprint.as_str(), key.label.as_str(), text)
            .await;
    }

    /// Spend one rate-limit token, waiting up to the configured deadline.
    pub(crate) async fn admit(&self) -> Result<()> {
        self.resilience
            .rate_limiter
            .acquire(self.config.rate_limit_wait)
            .await
            .map_err(|e| {
                warn!(session = %self.session.id(), "turn rejected by rate limiter");
                AgentError::from(e)
            })
    }

    pub(crate) fn build_request(&self, messages: &[Message], capabilities: &CapabilitySet) -> CompletionRequest {
        let mut request = CompletionRequest::new(
            self.config.model.clone(),
            messages.to_vec(),
            self.config.max_tokens,
        )
        .with_tools(tool_definitions(capabilities));

        if let Some(ref system) = self.config.system_prompt {
            request = request.with_system(system.clone());
        }
        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }
        request
    }

    /// One LLM call: breaker around retry around the backend.
    pub(crate) async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let backend = &self.backend;
        let retry = &self.resilience.retry;
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "calling LLM"
        );

        let attempt = || backend.complete(request.clone());
        let response = self
            .resilience
            .breaker
            .call(|| retry.run(attempt, LlmError::is_retryable))
            .await?;
        Ok(response)
    }

    /// Open a response stream under a breaker permit. The caller reports the
    /// outcome on the permit once the stream is drained.
    pub(crate) async fn open_stream(&self, request: CompletionRequest) -> Result<(ResponseStream, Permit)> {
        let permit = self.resilience.breaker.try_acquire().map_err(|open| AgentError::CircuitOpen {
            retry_after: open.retry_after,
        })?;

        let backend = &self.backend;
        match self
            .resilience
            .retry
            .run(|| backend.complete_stream(request.clone()), LlmError::is_retryable)
            .await
        {
            Ok(stream) => Ok((stream, permit)),
            Err(e) => {
                permit.failure();
                Err(AgentError::from(CircuitError::Inner(e)))
            }
        }
    }

    /// Invoke one requested tool. Failures become error records for the model.
    pub(crate) async fn dispatch(&self, tool_use: &ToolUseBlock) -> ToolCallRecord {
        let (success, content) = match self
            .session
            .invoke_tool(&tool_use.name, Some(tool_use.input.clone()))
            .await
        {
            Ok(result) => (!result.is_error(), result.text()),
            Err(e) => {
                warn!(tool = %tool_use.name, error = %e, "tool invocation failed");
                (false, e.to_string())
            }
        };

        ToolCallRecord {
            id: tool_use.id.clone(),
            name: tool_use.name.clone(),
            arguments: tool_use.input.clone(),
            success,
            content,
        }
    }
}

/// Tool result block fed back to the model.
pub(crate) fn result_block(record: &ToolCallRecord) -> ContentBlock {
    if record.success {
        ContentBlock::tool_result_success(&record.id, &record.content)
    } else {
        ContentBlock::tool_result_error(&record.id, &record.content)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent Runtime
// ─────────────────────────────────────────────────────────────────────────────

/// Runs chat turns against one session.
#[derive(Clone)]
pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("backend", &self.inner.backend.name())
            .field("session", &self.inner.session.id())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl AgentRuntime {
    /// Create a new builder.
    pub fn builder() -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::new()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    pub fn resilience(&self) -> &Arc<ResilienceLayer> {
        &self.inner.resilience
    }

    pub fn backend(&self) -> SharedBackend {
        self.inner.backend.clone()
    }

    /// Conversation so far.
    pub async fn history(&self) -> Vec<Message> {
        self.inner.history.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.inner.history.lock().await.clear();
    }

    /// Run one turn to completion.
    pub async fn chat(&self, message: &str) -> Result<ChatResponse> {
        let inner = &self.inner;
        inner.require_active()?;

        let mut history = inner.history.lock().await;
        let session_id = inner.session.id();
        info!(session = %session_id, message_len = message.len(), "turn started");

        let key = inner.turn_key(message);
        if let Some(text) = inner.cached_answer(&key).await {
            history.push(Message::user(message));
            history.push(Message::assistant(text.clone()));
            info!(session = %session_id, cached = true, "turn completed");
            return Ok(ChatResponse::cached(text));
        }

        inner.admit().await?;

        let mut messages = history.clone();
        messages.push(Message::user(message));
        let mut usage = Usage::default();
        let mut tool_calls = Vec::new();
        let mut iterations = 0u32;
        let mut consistent = true;

        loop {
            iterations += 1;
            if iterations > inner.config.max_iterations {
                warn!(session = %session_id, iterations, "max iterations exceeded");
                return Err(AgentError::MaxIterations(inner.config.max_iterations));
            }

            // Re-read every iteration: a failed server drops out mid-turn.
            let capabilities = inner.session.capabilities();
            consistent &= key.matches(&capabilities);
            let request = inner.build_request(&messages, &capabilities);
            let response = inner.complete(request).await?;
            usage.add(response.usage);

            if response.has_tool_use() {
                let tool_uses = response.tool_uses();
                info!(
                    session = %session_id,
                    iteration = iterations,
                    tool_count = tool_uses.len(),
                    "executing tools"
                );

                let mut results = Vec::with_capacity(tool_uses.len());
                for tool_use in &tool_uses {
                    let record = inner.dispatch(tool_use).await;
                    results.push(result_block(&record));
                    tool_calls.push(record);
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
                tool_calls = tool_calls.len(),
                "turn completed"
            );
            return Ok(ChatResponse {
                text,
                cached: false,
                iterations,
                usage,
                tool_calls,
            });
        }
    }

    /// Run one turn, streaming text and tool events as they happen.
    ///
    /// Cancelling `cancellation` ends the stream with an error chunk; the
    /// session stays active and the history is left as it was.
    pub fn chat_stream(&self, message: &str, cancellation: CancellationToken) -> AgentStream {
        create_turn_stream(self.inner.clone(), message.to_string(), cancellation)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`AgentRuntime`].
#[derive(Default)]
pub struct AgentRuntimeBuilder {
    backend: Option<SharedBackend>,
    session: Option<Arc<Session>>,
    resilience: Option<Arc<ResilienceLayer>>,
    config: AgentConfig,
}

impl AgentRuntimeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: SharedBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// The session to run turns against. It must already be entered.
    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    /// Shared policies. Defaults to a private layer with default settings.
    pub fn with_resilience(mut self, resilience: Arc<ResilienceLayer>) -> Self {
        self.resilience = Some(resilience);
        self
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the runtime.
    pub fn build(self) -> Result<AgentRuntime> {
        let backend = self
            .backend
            .ok_or_else(|| AgentError::config("LLM backend is required"))?;
        let session = self
            .session
            .ok_or_else(|| AgentError::config("session is required"))?;

        Ok(AgentRuntime {
            inner: Arc::new(RuntimeInner {
                backend,
                session,
                resilience: self.resilience.unwrap_or_default(),
                config: self.config,
                history: tokio::sync::Mutex::new(Vec::new()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_config::ServerDescriptor;
    use conduit_llm::{MockBackend, text_response, tool_use_response};
    use conduit_mcp::MockAdapter;
    use conduit_session::SessionOptions;
    use serde_json::json;

    async fn active_session(mock: &MockAdapter) -> Arc<Session> {
        let session = Session::new(
            vec![ServerDescriptor::stdio("alpha", "alpha-server")],
            mock.adapter_set(),
            SessionOptions::default(),
        );
        session.enter().await.unwrap();
        Arc::new(session)
    }

    fn runtime(backend: Arc<MockBackend>, session: Arc<Session>) -> AgentRuntime {
        AgentRuntime::builder()
            .with_backend(backend)
            .with_session(session)
            .with_config(AgentConfig::new("test-model"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_backend() {
        let err = AgentRuntime::builder().build().unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[tokio::test]
    async fn test_chat_text_reply() {
        let mock = MockAdapter::new().with_tools("alpha", &["read"]);
        let backend = Arc::new(MockBackend::with_text("hello"));
        let agent = runtime(backend.clone(), active_session(&mock).await);

        let response = agent.chat("hi").await.unwrap();
        assert_eq!(response.text, "hello");
        assert!(!response.cached);
        assert_eq!(response.iterations, 1);
        assert_eq!(agent.history().await.len(), 2);

        let request = backend.last_request().unwrap();
        assert_eq!(request.model, "test-model");
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.tools[0].name, "read");
    }

    #[tokio::test]
    async fn test_chat_tool_loop() {
        let mock = MockAdapter::new().with_tools("alpha", &["read"]);
        let backend = Arc::new(MockBackend::new(vec![
            tool_use_response("call_1", "read", json!({"path": "a.txt"})),
            text_response("done"),
        ]));
        let agent = runtime(backend.clone(), active_session(&mock).await);

        let response = agent.chat("read a.txt").await.unwrap();
        assert_eq!(response.text, "done");
        assert_eq!(response.iterations, 2);
        assert_eq!(response.tool_calls.len(), 1);
        assert!(response.tool_calls[0].success);
        assert!(response.tool_calls[0].content.starts_with("alpha:read"));
        assert_eq!(response.usage.input_tokens, 20);

        // user, assistant tool_use, tool results, final answer
        assert_eq!(agent.history().await.len(), 4);
        let second = &backend.requests()[1];
        assert!(matches!(
            second.messages.last().unwrap().content[0],
            ContentBlock::ToolResult { is_error: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_error_result() {
        let mock = MockAdapter::new().with_tools("alpha", &["read"]);
        let backend = Arc::new(MockBackend::new(vec![
            tool_use_response("call_1", "nope", json!({})),
            text_response("sorry"),
        ]));
        let agent = runtime(backend, active_session(&mock).await);

        let response = agent.chat("do it").await.unwrap();
        assert!(!response.tool_calls[0].success);
        assert!(response.tool_calls[0].content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn test_max_iterations() {
        let mock = MockAdapter::new().with_tools("alpha", &["read"]);
        let backend = Arc::new(MockBackend::new(Vec::new()));
        for i in 0..5 {
            backend.push_response(tool_use_response(format!("call_{i}"), "read", json!({})));
        }
        let agent = AgentRuntime::builder()
            .with_backend(backend)
            .with_session(active_session(&mock).await)
            .with_config(AgentConfig::new("m").with_max_iterations(2))
            .build()
            .unwrap();

        let err = agent.chat("loop").await.unwrap_err();
        assert!(matches!(err, AgentError::MaxIterations(2)));
        assert!(agent.history().await.is_empty());
    }
}
