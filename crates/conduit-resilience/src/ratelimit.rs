//! Token-bucket admission control using governor.
//!
//! The bucket holds up to `capacity` tokens and refills at
//! `refill_per_minute`. Each chat turn that misses the cache spends one.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use conduit_config::RateLimitSection;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as Governor};
use serde::Serialize;
use tracing::debug;

use crate::error::RateLimitExceeded;

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Rate limiter counters and settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub accepted: u64,
    pub rejected: u64,
    pub capacity: u32,
    pub refill_per_minute: u32,
    pub enabled: bool,
}

/// Shared token bucket.
pub struct RateLimiter {
    limiter: DefaultDirectRateLimiter,
    capacity: u32,
    refill_per_minute: u32,
    enabled: AtomicBool,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_section(&RateLimitSection::default())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("refill_per_minute", &self.refill_per_minute)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Implementation
// ─────────────────────────────────────────────────────────────────────────────

impl RateLimiter {
    /// Create a limiter. Zero values are raised to one.
    pub fn new(capacity: u32, refill_per_minute: u32) -> Self {
        let burst = NonZeroU32::new(capacity).unwrap_or(NonZeroU32::MIN);
        let refill = NonZeroU32::new(refill_per_minute).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_minute(refill).allow_burst(burst);

        Self {
            limiter: Governor::direct(quota),
            capacity: burst.get(),
            refill_per_minute: refill.get(),
            enabled: AtomicBool::new(true),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn from_section(section: &RateLimitSection) -> Self {
        let limiter = Self::new(section.capacity, section.refill_per_minute);
        limiter.set_enabled(section.enabled);
        limiter
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        debug!(enabled, "rate limiter toggled");
    }

    /// Take a token now or fail without waiting.
    pub fn try_acquire(&self) -> Result<(), RateLimitExceeded> {
        if !self.is_enabled() {
            return Ok(());
        }

        match self.limiter.check() {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(not_until) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                let retry_after = not_until.wait_time_from(DefaultClock::default().now());
                debug!(retry_after_ms = retry_after.as_millis() as u64, "rate limit exceeded");
                Err(RateLimitExceeded {
                    retry_after: Some(retry_after),
                })
            }
        }
    }

    /// Wait up to `deadline` for a token.
    pub async fn acquire(&self, deadline: Duration) -> Result<(), RateLimitExceeded> {
        if !self.is_enabled() {
            return Ok(());
        }

        if deadline.is_zero() {
            return self.try_acquire();
        }

        match tokio::time::timeout(deadline, self.limiter.until_ready()).await {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(deadline_ms = deadline.as_millis() as u64, "rate limit wait timed out");
                Err(RateLimitExceeded { retry_after: None })
            }
        }
    }

    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            capacity: self.capacity,
            refill_per_minute: self.refill_per_minute,
            enabled: self.is_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_plus_one_rejects_last() {
        let limiter = RateLimiter::new(5, 5);
        for _ in 0..5 {
            assert!(limiter.try_acquire().is_ok());
        }
        let err = limiter.try_acquire().unwrap_err();
        assert!(err.retry_after.is_some_and(|d| d > Duration::ZERO));

        let stats = limiter.stats();
        assert_eq!(stats.accepted, 5);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.capacity, 5);
    }

    #[test]
    fn test_disabled_admits_without_counting() {
        let limiter = RateLimiter::new(1, 1);
        limiter.set_enabled(false);
        for _ in 0..10 {
            assert!(limiter.try_acquire().is_ok());
        }
        let stats = limiter.stats();
        assert_eq!(stats.accepted, 0);
        assert_eq!(stats.rejected, 0);
        assert!(!stats.enabled);

        limiter.set_enabled(true);
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_err());
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let limiter = RateLimiter::new(1, 1);
        assert!(limiter.acquire(Duration::from_millis(50)).await.is_ok());

        // The next token is a minute away.
        let err = limiter.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.retry_after, None);
        assert_eq!(limiter.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_acquire_zero_deadline_does_not_wait() {
        let limiter = RateLimiter::new(1, 1);
        assert!(limiter.acquire(Duration::ZERO).await.is_ok());
        assert!(limiter.acquire(Duration::ZERO).await.is_err());
    }

    #[test]
    fn test_zero_values_raised() {
        let limiter = RateLimiter::new(0, 0);
        let stats = limiter.stats();
        assert_eq!(stats.capacity, 1);
        assert_eq!(stats.refill_per_minute, 1);
    }
}
