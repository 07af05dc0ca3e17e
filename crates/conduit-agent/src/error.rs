//! Error types for the agent crate.

use std::time::Duration;

use conduit_llm::LlmError;
use conduit_resilience::{CircuitError, RateLimitExceeded, RetryError};
use serde::Serialize;
use thiserror::Error;

/// Result type alias using the agent error type.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Error type for agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The session was never entered or has already exited.
    #[error("Session is not active")]
    SessionNotActive,

    /// The circuit breaker is refusing LLM calls.
    #[error("Circuit breaker open, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    /// No rate-limit token became available in time.
    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: Option<Duration> },

    /// A transient LLM failure persisted through every retry.
    #[error("LLM call failed after {attempts} attempts: {source}")]
    Invocation {
        attempts: u32,
        #[source]
        source: LlmError,
    },

    /// A permanent LLM failure.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Task was cancelled.
    #[error("Task cancelled")]
    Cancelled,

    /// Maximum iterations exceeded.
    #[error("Maximum iterations exceeded: {0}")]
    MaxIterations(u32),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Machine-readable category of an [`AgentError`], carried on stream error
/// chunks so callers can branch without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SessionNotActive,
    CircuitOpen,
    RateLimited,
    Invocation,
    Llm,
    Cancelled,
    MaxIterations,
    Config,
}

impl AgentError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionNotActive => ErrorKind::SessionNotActive,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimited,
            Self::Invocation { .. } => ErrorKind::Invocation,
            Self::Llm(_) => ErrorKind::Llm,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::MaxIterations(_) => ErrorKind::MaxIterations,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// How long to wait before trying again, when the error says.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after } => Some(*retry_after),
            Self::RateLimitExceeded { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<RateLimitExceeded> for AgentError {
    fn from(e: RateLimitExceeded) -> Self {
        Self::RateLimitExceeded {
            retry_after: e.retry_after,
        }
    }
}

impl From<CircuitError<RetryError<LlmError>>> for AgentError {
    fn from(e: CircuitError<RetryError<LlmError>>) -> Self {
        match e {
            CircuitError::Open { retry_after } => Self::CircuitOpen { retry_after },
            CircuitError::Inner(RetryError::Exhausted { attempts, last }) => Self::Invocation {
                attempts,
                source: last,
            },
            CircuitError::Inner(RetryError::Permanent(e)) => Self::Llm(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protected_call_errors_map() {
        let open: AgentError = CircuitError::<RetryError<LlmError>>::Open {
            retry_after: Duration::from_secs(3),
        }
        .into();
        assert!(matches!(open, AgentError::CircuitOpen { retry_after } if retry_after.as_secs() == 3));

        let exhausted: AgentError = CircuitError::Inner(RetryError::Exhausted {
            attempts: 3,
            last: LlmError::Network("reset".into()),
        })
        .into();
        assert!(matches!(exhausted, AgentError::Invocation { attempts: 3, .. }));
        assert!(exhausted.to_string().contains("after 3 attempts"));

        let permanent: AgentError =
            CircuitError::Inner(RetryError::Permanent(LlmError::Auth("bad key".into()))).into();
        assert!(matches!(permanent, AgentError::Llm(LlmError::Auth(_))));
    }

    #[test]
    fn test_rate_limit_conversion() {
        let err: AgentError = RateLimitExceeded { retry_after: None }.into();
        assert!(matches!(err, AgentError::RateLimitExceeded { retry_after: None }));
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn test_kind_and_retry_after() {
        let open = AgentError::CircuitOpen {
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(open.kind(), ErrorKind::CircuitOpen);
        assert_eq!(open.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(AgentError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(AgentError::MaxIterations(3).retry_after(), None);
        assert_eq!(serde_json::to_value(ErrorKind::SessionNotActive).unwrap(), "session_not_active");
    }
}
