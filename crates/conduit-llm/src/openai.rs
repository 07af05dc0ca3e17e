//! OpenAI-compatible API backend implementation.
//!
//! `OpenAiBackend` talks to any service exposing `/chat/completions` in the
//! OpenAI format (Ollama, vLLM, llama.cpp server, OpenAI itself). The default
//! configuration targets a local Ollama instance.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode, header};
use std::time::Duration;

use crate::backend::{BlockStart, ContentDelta, LlmBackend, ResponseStream, StreamEvent};
use crate::error::{LlmError, RateLimitInfo, Result};
use crate::types::{
    CompletionRequest, CompletionResponse, ContentBlock, Role, StopReason, Usage,
};

/// Default base URL (local Ollama).
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";

/// Default timeout for requests.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for the OpenAI-compatible backend.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key for authentication (optional for local services like Ollama).
    pub api_key: Option<String>,

    /// Base URL for the API, without the `/chat/completions` suffix.
    pub base_url: String,

    /// Model used when a request does not name one.
    pub model: Option<String>,

    /// Request timeout.
    pub timeout: Duration,

    /// Name for this backend instance.
    pub name: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self::ollama()
    }
}

impl OpenAiConfig {
    /// Config for a local Ollama server.
    pub fn ollama() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            name: "ollama".to_string(),
        }
    }

    /// Config for an arbitrary OpenAI-compatible endpoint.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            name: "openai-compatible".to_string(),
            ..Self::ollama()
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let key = api_key.into();
        self.api_key = (!key.is_empty()).then_some(key);
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI Backend
// ─────────────────────────────────────────────────────────────────────────────

/// OpenAI-compatible API backend.
pub struct OpenAiBackend {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiBackend {
    /// Create a new backend with the given configuration.
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Create an Ollama backend with default local settings.
    pub fn ollama() -> Result<Self> {
        Self::new(OpenAiConfig::ollama())
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.config.base_url.trim_end_matches('/'))
    }

    fn add_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header(header::CONTENT_TYPE, "application/json");

        if let Some(ref api_key) = self.config.api_key {
            builder.header(header::AUTHORIZATION, format!("Bearer {}", api_key))
        } else {
            builder
        }
    }

    fn resolve_model(&self, request: &CompletionRequest) -> Result<String> {
        if !request.model.is_empty() {
            return Ok(request.model.clone());
        }
        self.config
            .model
            .clone()
            .ok_or_else(|| LlmError::Config("no model configured".to_string()))
    }

    /// Convert a [`CompletionRequest`] to the OpenAI chat format.
    fn to_openai_request(&self, request: &CompletionRequest) -> Result<OpenAiChatRequest> {
        let mut messages: Vec<OpenAiMessage> = Vec::new();

        if let Some(ref system) = request.system {
            messages.push(OpenAiMessage::text("system", system.clone()));
        }

        for m in &request.messages {
            let mut text = String::new();
            let mut tool_calls = Vec::new();
            let mut tool_results = Vec::new();

            for block in &m.content {
                match block {
                    ContentBlock::Text { text: t } => text.push_str(t),
                    ContentBlock::ToolUse { id, name, input } => tool_calls.push(OpenAiToolCall {
                        id: id.clone(),
                        call_type: "function".to_string(),
                        function: OpenAiFunctionCall {
                            name: name.clone(),
                            arguments: serde_json::to_string(input)?,
                        },
                    }),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => tool_results.push((tool_use_id.clone(), content.clone())),
                }
            }

            if !tool_results.is_empty() {
                // Each tool result becomes its own "tool" role message.
                for (tool_id, result_text) in tool_results {
                    messages.push(OpenAiMessage {
                        role: "tool".to_string(),
                        content: Some(result_text),
                        tool_calls: None,
                        tool_call_id: Some(tool_id),
                    });
                }
            } else if !tool_calls.is_empty() {
                messages.push(OpenAiMessage {
                    role: "assistant".to_string(),
                    content: (!text.is_empty()).then_some(text),
                    tool_calls: Some(tool_calls),
                    tool_call_id: None,
                });
            } else {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                messages.push(OpenAiMessage::text(role, text));
            }
        }

        let tools = (!request.tools.is_empty()).then(|| {
            request
                .tools
                .iter()
                .map(|t| OpenAiTool {
                    tool_type: "function".to_string(),
                    function: OpenAiFunction {
                        name: t.name.clone(),
                        description: Some(t.description.clone()),
                        parameters: t.input_schema.clone(),
                    },
                })
                .collect()
        });

        Ok(OpenAiChatRequest {
            model: self.resolve_model(request)?,
            messages,
            max_tokens: Some(request.max_tokens),
            temperature: request.temperature,
            stream: Some(request.stream),
            tools,
        })
    }

    async fn send(&self, body: &OpenAiChatRequest) -> Result<Response> {
        let response = self
            .add_headers(self.client.post(self.completions_url()))
            .json(body)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::handle_error_response(response).await)
        }
    }

    /// Map a non-success response to a typed error.
    async fn handle_error_response(response: Response) -> LlmError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<OpenAiErrorResponse>(&body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| format!("HTTP {}: {}", status, body));

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::Auth(message),
            StatusCode::TOO_MANY_REQUESTS => {
                LlmError::RateLimit(RateLimitInfo::from_header(message, retry_after.as_deref()))
            }
            StatusCode::REQUEST_TIMEOUT => LlmError::Network(message),
            s if s.is_server_error() => LlmError::Unavailable(message),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                LlmError::InvalidRequest(message)
            }
            _ => LlmError::Backend(message),
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let mut request = request;
        request.stream = false;

        let openai_request = self.to_openai_request(&request)?;

        tracing::debug!(
            backend = %self.config.name,
            model = %openai_request.model,
            messages = openai_request.messages.len(),
            tools = openai_request.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            "Sending OpenAI-compatible request"
        );

        let response = self.send(&openai_request).await?;
        let body = response.text().await?;
        let parsed: OpenAiChatResponse = serde_json::from_str(&body)?;
        Ok(parsed.into())
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<ResponseStream> {
        let mut request = request;
        request.stream = true;

        let openai_request = self.to_openai_request(&request)?;
        tracing::debug!(
            backend = %self.config.name,
            model = %openai_request.model,
            "Opening OpenAI-compatible stream"
        );

        let response = self.send(&openai_request).await?;

        let mut decoder = ChunkDecoder::default();
        let events = response
            .bytes_stream()
            .eventsource()
            .map(move |event| match event {
                Ok(event) => decoder.decode(&event.data),
                Err(e) => vec![Err(LlmError::Network(e.to_string()))],
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(events))
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .add_headers(self.client.get(self.models_url()))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::handle_error_response(response).await)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI API Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, serde::Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
}

#[derive(Debug, serde::Serialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OpenAiMessage {
    fn text(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAiFunction,
}

#[derive(Debug, serde::Serialize)]
struct OpenAiFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: OpenAiFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    id: String,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    model: String,
    usage: Option<OpenAiUsage>,
}

impl From<OpenAiChatResponse> for CompletionResponse {
    fn from(resp: OpenAiChatResponse) -> Self {
        let mut content = Vec::new();
        let mut stop_reason = StopReason::EndTurn;

        if let Some(choice) = resp.choices.into_iter().next() {
            if let Some(text) = choice.message.content
                && !text.is_empty()
            {
                content.push(ContentBlock::Text { text });
            }

            for tc in choice.message.tool_calls.unwrap_or_default() {
                let input = serde_json::from_str(&tc.function.arguments)
                    .unwrap_or_else(|_| serde_json::json!({}));
                content.push(ContentBlock::ToolUse {
                    id: tc.id,
                    name: tc.function.name,
                    input,
                });
            }

            if let Some(reason) = choice.finish_reason.as_deref() {
                stop_reason = StopReason::from_finish_reason(reason);
            }
        }

        // Some servers report "stop" even when tool calls are present.
        if content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
        {
            stop_reason = StopReason::ToolUse;
        }

        CompletionResponse::new(
            resp.id,
            resp.model,
            content,
            stop_reason,
            resp.usage.map(Usage::from).unwrap_or_default(),
        )
    }
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<OpenAiUsage> for Usage {
    fn from(u: OpenAiUsage) -> Self {
        Usage::new(u.prompt_tokens, u.completion_tokens)
    }
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiErrorResponse {
    error: OpenAiError,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiError {
    message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE Streaming
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiStreamChoice {
    delta: Option<OpenAiStreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiStreamToolCall>>,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiStreamToolCall {
    index: Option<usize>,
    id: Option<String>,
    function: Option<OpenAiStreamFunction>,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

/// Turns `data:` payloads of an OpenAI chat stream into [`StreamEvent`]s.
///
/// Text always lives in block 0; tool call `i` lives in block `i + 1`.
#[derive(Default)]
struct ChunkDecoder {
    started: bool,
    text_open: bool,
    done: bool,
    stop_reason: Option<StopReason>,
}

impl ChunkDecoder {
    fn decode(&mut self, data: &str) -> Vec<Result<StreamEvent>> {
        if self.done {
            return Vec::new();
        }
        if data.trim() == "[DONE]" {
            self.done = true;
            return vec![Ok(StreamEvent::MessageStop)];
        }

        let chunk: OpenAiStreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparsable stream chunk");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                id: chunk.id,
                model: chunk.model,
            });
        }

        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(delta) = choice.delta {
                if let Some(content) = delta.content
                    && !content.is_empty()
                {
                    if !self.text_open {
                        self.text_open = true;
                        events.push(StreamEvent::ContentBlockStart {
                            index: 0,
                            block: BlockStart::Text,
                        });
                    }
                    events.push(StreamEvent::ContentBlockDelta {
                        index: 0,
                        delta: ContentDelta::TextDelta(content),
                    });
                }

                for tc in delta.tool_calls.unwrap_or_default() {
                    let index = tc.index.unwrap_or(0) + 1;
                    let (name, arguments) = match tc.function {
                        Some(f) => (f.name, f.arguments),
                        None => (None, None),
                    };
                    if let Some(id) = tc.id {
                        events.push(StreamEvent::ContentBlockStart {
                            index,
                            block: BlockStart::ToolUse {
                                id,
                                name: name.unwrap_or_default(),
                            },
                        });
                    }
                    if let Some(args) = arguments
                        && !args.is_empty()
                    {
                        events.push(StreamEvent::ContentBlockDelta {
                            index,
                            delta: ContentDelta::InputJsonDelta(args),
                        });
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                let stop_reason = StopReason::from_finish_reason(&reason);
                self.stop_reason = Some(stop_reason);
                events.push(StreamEvent::MessageDelta {
                    stop_reason,
                    usage: chunk.usage.map(Usage::from).unwrap_or_default(),
                });
                return events.into_iter().map(Ok).collect();
            }
        }

        // Usage-only trailer chunk.
        if let Some(usage) = chunk.usage {
            events.push(StreamEvent::MessageDelta {
                stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
                usage: usage.into(),
            });
        }

        events.into_iter().map(Ok).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
