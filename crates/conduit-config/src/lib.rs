//! Configuration for the Conduit agent runtime.
//!
//! Provides:
//! - [`ServerDescriptor`]: how to reach one tool server (stdio, HTTP, SSE)
//! - [`ServerRegistry`]: the ordered, persisted set of descriptors
//! - [`RuntimeConfig`]: immutable `conduit.toml` sections for the LLM backend,
//!   agent loop, session aggregation, and resilience policies
//! - `${VAR}` / `${VAR:-default}` substitution in descriptor fields
//!
//! The registry holds configuration only. Live connections belong to a session.

pub mod descriptor;
pub mod env;
pub mod error;
pub mod registry;
pub mod runtime;

pub use descriptor::{
    DEFAULT_HEARTBEAT_SECS, DEFAULT_TIMEOUT_SECS, Framing, ServerDescriptor, TransportKind,
};
pub use error::{ConfigError, Result};
pub use registry::ServerRegistry;
pub use runtime::{
    AgentSection, CONFIG_ENV, CacheSection, CircuitBreakerSection, CollisionPolicy, LlmSection,
    RateLimitSection, ResilienceConfig, RetrySection, RuntimeConfig, SessionSection, config_dir,
    resolve_config_path,
};
