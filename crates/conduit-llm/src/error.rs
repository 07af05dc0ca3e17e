//! Backend failures and their retry classification.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

// ─────────────────────────────────────────────────────────────────────────────
// Provider Throttling
// ─────────────────────────────────────────────────────────────────────────────

/// Information about a provider-side rate limit.
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub message: String,
    /// Parsed `Retry-After`, when the provider sent one.
    pub retry_after: Option<Duration>,
}

impl RateLimitInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Build from a message and an optional `Retry-After` header value.
    pub fn from_header(message: impl Into<String>, retry_after_header: Option<&str>) -> Self {
        Self {
            message: message.into(),
            retry_after: retry_after_header.and_then(parse_retry_after),
        }
    }
}

impl fmt::Display for RateLimitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.retry_after {
            Some(wait) => write!(f, "{} (retry after {:.2}s)", self.message, wait.as_secs_f64()),
            None => f.write_str(&self.message),
        }
    }
}

/// Only the delta-seconds form is understood.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LlmError {
    /// Provider rejected the request (4xx other than auth and 429).
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Network error: {0}")]
    Network(String),

    /// The provider answered with a 5xx status (retryable).
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// Configuration error (bad base URL, missing model, etc.).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Body did not parse as the expected JSON.
    #[error("Malformed payload: {0}")]
    Serialization(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// HTTP 429.
    #[error("Rate limited by provider: {0}")]
    RateLimit(RateLimitInfo),

    /// HTTP 401 or 403.
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LlmError {
    /// A 429 without a usable `Retry-After`.
    pub fn rate_limit(message: impl Into<String>) -> Self {
        LlmError::RateLimit(RateLimitInfo::new(message))
    }

    /// Provider-requested delay, for rate limit errors only.
    pub fn retry_after(&self) -> Option<Duration> {
        if let LlmError::RateLimit(info) = self {
            info.retry_after
        } else {
            None
        }
    }

    /// Returns true if a later attempt of the same request may succeed.
    ///
    /// Network failures, 5xx responses, and provider rate limits are
    /// transient. Everything else is permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Unavailable(_) | Self::RateLimit(_)
        )
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            return LlmError::Config(e.to_string());
        }
        let detail = if e.is_timeout() {
            format!("timed out: {}", e)
        } else if e.is_connect() {
            format!("could not connect: {}", e)
        } else {
            e.to_string()
        };
        LlmError::Network(detail)
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(LlmError::Network("timeout".to_string()).is_retryable());
        assert!(LlmError::Unavailable("503".to_string()).is_retryable());
        assert!(LlmError::rate_limit("rate limited").is_retryable());
        assert!(!LlmError::Config("bad config".to_string()).is_retryable());
        assert!(!LlmError::Auth("unauthorized".to_string()).is_retryable());
        assert!(!LlmError::Backend("bad request".to_string()).is_retryable());
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 10 "), Some(Duration::from_secs(10)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_rate_limit_retry_after() {
        let err = LlmError::RateLimit(RateLimitInfo::from_header("limited", Some("7")));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert!(err.to_string().contains("retry after 7.00s"));

        assert_eq!(LlmError::rate_limit("limited").retry_after(), None);
        assert_eq!(LlmError::Network("x".to_string()).retry_after(), None);
    }
}
