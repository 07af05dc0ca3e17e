//! LLM backend abstraction for Conduit.
//!
//! The agent runtime talks to an inference service only through the
//! [`LlmBackend`] trait. The crate ships one real implementation for
//! OpenAI-compatible servers (Ollama by default) and, behind the `testing`
//! feature, a scriptable [`MockBackend`].
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  LlmBackend trait                       │
//! │  - complete() -> CompletionResponse     │
//! │  - complete_stream() -> Stream<Event>   │
//! └─────────────────────────────────────────┘
//!                    │
//!          ┌─────────┴─────────┐
//!          ▼                   ▼
//!   ┌──────────────┐    ┌─────────────┐
//!   │ OpenAiBackend│    │ MockBackend │
//!   └──────────────┘    └─────────────┘
//! ```

pub mod backend;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod mock;
pub mod openai;
pub mod types;

pub use backend::{
    BlockStart, ContentDelta, LlmBackend, ResponseStream, SharedBackend, StreamAccumulator,
    StreamEvent, response_events,
};
pub use error::{LlmError, RateLimitInfo, Result};
#[cfg(any(test, feature = "testing"))]
pub use mock::{MockBackend, MockResponse, text_response, tool_use_response};
pub use openai::{OpenAiBackend, OpenAiConfig};
pub use types::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, Role, StopReason,
    ToolDefinition, ToolUseBlock, Usage,
};
