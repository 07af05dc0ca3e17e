//! The bundle of policies shared by every runtime in the process.

use std::sync::Arc;

use conduit_config::ResilienceConfig;
use serde::Serialize;

use crate::breaker::{CircuitBreaker, CircuitSnapshot};
use crate::cache::{CacheStats, ResponseCache};
use crate::ratelimit::{RateLimitStats, RateLimiter};
use crate::retry::RetryPolicy;

/// Retry, circuit breaker, response cache, and rate limiter built from one
/// `[resilience]` config.
#[derive(Debug, Default)]
pub struct ResilienceLayer {
    pub retry: RetryPolicy,
    pub breaker: CircuitBreaker,
    pub cache: ResponseCache,
    pub rate_limiter: RateLimiter,
}

/// Combined counters for status output.
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceStats {
    pub circuit: CircuitSnapshot,
    pub cache: CacheStats,
    pub rate_limit: RateLimitStats,
}

impl ResilienceLayer {
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            retry: RetryPolicy::from_section(&config.retry),
            breaker: CircuitBreaker::from_section(&config.circuit_breaker),
            cache: ResponseCache::from_section(&config.cache),
            rate_limiter: RateLimiter::from_section(&config.rate_limit),
        }
    }

    pub fn shared(config: &ResilienceConfig) -> Arc<Self> {
        Arc::new(Self::from_config(config))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub async fn stats(&self) -> ResilienceStats {
        ResilienceStats {
            circuit: self.breaker.state(),
            cache: self.cache.stats().await,
            rate_limit: self.rate_limiter.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;

    #[tokio::test]
    async fn test_from_config() {
        let mut config = ResilienceConfig::default();
        config.retry.max_attempts = 7;
        config.cache.enabled = false;
        config.rate_limit.capacity = 3;

        let layer = ResilienceLayer::from_config(&config);
        assert_eq!(layer.retry.max_attempts, 7);
        assert!(!layer.cache.is_enabled());

        let stats = layer.stats().await;
        assert_eq!(stats.circuit.state, CircuitState::Closed);
        assert_eq!(stats.rate_limit.capacity, 3);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["cache"]["enabled"], false);
    }
}
