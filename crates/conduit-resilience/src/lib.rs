//! Resilience policies for Conduit.
//!
//! Every LLM call made by the agent runtime passes through these, outermost
//! first:
//!
//! ```text
//! ResponseCache ─hit─▶ answer
//!      │ miss
//!      ▼
//! RateLimiter ──reject──▶ RateLimitExceeded
//!      │
//!      ▼
//! CircuitBreaker ──open──▶ CircuitOpen
//!      │
//!      ▼
//! RetryPolicy ──▶ backend call
//! ```
//!
//! One [`ResilienceLayer`] is built from `[resilience]` config and shared by
//! all runtimes in the process.

pub mod breaker;
pub mod cache;
pub mod error;
pub mod fingerprint;
pub mod layer;
pub mod ratelimit;
pub mod retry;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitSnapshot, CircuitState, Permit};
pub use cache::{CacheEntry, CacheStats, ResponseCache};
pub use error::{CircuitError, CircuitOpen, RateLimitExceeded, RetryError};
pub use fingerprint::{FINGERPRINT_VERSION, Fingerprint, normalize, sha256_hex};
pub use layer::{ResilienceLayer, ResilienceStats};
pub use ratelimit::{RateLimitStats, RateLimiter};
pub use retry::RetryPolicy;
