//! Exponential backoff retry.

use std::future::Future;
use std::time::Duration;

use conduit_config::RetrySection;
use rand::Rng;

use crate::error::RetryError;

/// Retry policy with exponential backoff and jitter.
///
/// `max_attempts` counts the first attempt, so `1` disables retrying.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of each delay applied as uniform random +/- jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_section(&RetrySection::default())
    }
}

impl RetryPolicy {
    pub fn from_section(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            initial_backoff: Duration::from_millis(section.initial_backoff_ms),
            max_backoff: Duration::from_millis(section.max_backoff_ms),
            multiplier: section.multiplier.max(1.0),
            jitter: section.jitter.clamp(0.0, 1.0),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_backoff)
    }

    /// Delay before retry number `retry`, with jitter applied.
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.backoff(retry);
        if self.jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 + self.jitter * rand::rng().random_range(-1.0..=1.0);
        base.mul_f64(factor.max(0.0))
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run
    /// out. Only errors for which `is_transient` returns true are retried.
    pub async fn run<T, E, F, Fut, C>(&self, mut operation: F, is_transient: C) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !is_transient(&e) => return Err(RetryError::Permanent(e)),
                Err(e) if attempt >= self.max_attempts => {
                    tracing::warn!(attempts = attempt, error = %e, "retries exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
