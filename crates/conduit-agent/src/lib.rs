//! Agent runtime for Conduit.
//!
//! An [`AgentRuntime`] pairs one LLM backend with one entered session and a
//! shared resilience layer, and runs chat turns against them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  AgentRuntime                                               │
//! │  - chat() / chat_stream()                                   │
//! │  - tool loop bounded by max_iterations                      │
//! │  - history committed only when a turn succeeds              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              ┌───────────────┼───────────────┐
//!              ▼               ▼               ▼
//!       ┌────────────┐  ┌─────────────┐  ┌──────────────┐
//!       │ LlmBackend │  │   Session   │  │  Resilience  │
//!       │(conduit-llm)│ │(tools, MCP) │  │    Layer     │
//!       └────────────┘  └─────────────┘  └──────────────┘
//! ```
//!
//! # Core Components
//!
//! - [`AgentRuntime`]: runs turns, built with [`AgentRuntimeBuilder`]
//! - [`AgentConfig`]: model, prompt and per-turn limits
//! - [`ChatResponse`]: output of a blocking turn
//! - [`StreamChunk`]: items of a streamed turn

pub mod error;
pub mod runtime;
pub mod stream;
pub mod types;

pub use error::{AgentError, ErrorKind, Result};
pub use runtime::{AgentRuntime, AgentRuntimeBuilder};
pub use stream::{AgentStream, StreamChunk};
pub use types::{AgentConfig, ChatResponse, ToolCallRecord, tool_definitions};

pub use tokio_util::sync::CancellationToken;
