//! Error types for the resilience policies.
//!
//! The retry and breaker errors are generic over the wrapped operation's error
//! so callers keep their own typed failures.

use std::time::Duration;
use thiserror::Error;

/// Returned when the circuit breaker refuses a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("circuit breaker open, retry in {retry_after:?}")]
pub struct CircuitOpen {
    /// Time until the breaker will admit a trial call.
    pub retry_after: Duration,
}

/// Outcome of [`CircuitBreaker::call`](crate::CircuitBreaker::call).
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The breaker is open; the operation was not run.
    #[error("circuit breaker open, retry in {retry_after:?}")]
    Open { retry_after: Duration },

    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> From<CircuitOpen> for CircuitError<E> {
    fn from(open: CircuitOpen) -> Self {
        CircuitError::Open {
            retry_after: open.retry_after,
        }
    }
}

/// Outcome of [`RetryPolicy::run`](crate::RetryPolicy::run).
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// A non-transient error ended the sequence early.
    #[error(transparent)]
    Permanent(E),
}

impl<E> RetryError<E> {
    /// The underlying error.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent(e) => e,
        }
    }

    pub fn inner(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent(e) => e,
        }
    }
}

/// Returned when the rate limiter refuses admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limit exceeded")]
pub struct RateLimitExceeded {
    /// Earliest time a token becomes available, when known.
    pub retry_after: Option<Duration>,
}
