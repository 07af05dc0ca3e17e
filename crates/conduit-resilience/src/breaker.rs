//! Circuit breaker with growing cooldown.
//!
//! State transitions:
//! - Closed -> Open: after `failure_threshold` consecutive failures
//! - Open -> HalfOpen: once the cooldown has elapsed, admitting one trial
//! - HalfOpen -> Closed: a call succeeds (cooldown returns to base)
//! - HalfOpen -> Open: a call fails (cooldown grows by the multiplier,
//!   capped at `max_cooldown`)
//!
//! Calls admitted before the breaker tripped may report while it is half-open.
//! They move the state exactly like the trial does.
//!
//! Time is read from `tokio::time::Instant` so tests can pause the clock.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use conduit_config::CircuitBreakerSection;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{CircuitError, CircuitOpen};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    #[serde(with = "millis")]
    pub cooldown: Duration,
    /// Time until a trial is admitted, while open.
    #[serde(with = "opt_millis")]
    pub retry_after: Option<Duration>,
}

/// Breaker tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    pub cooldown_multiplier: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from_section(&CircuitBreakerSection::default())
    }
}

impl BreakerConfig {
    pub fn from_section(section: &CircuitBreakerSection) -> Self {
        let cooldown = Duration::from_millis(section.cooldown_ms);
        Self {
            failure_threshold: section.failure_threshold.max(1),
            cooldown,
            max_cooldown: Duration::from_millis(section.max_cooldown_ms).max(cooldown),
            cooldown_multiplier: section.cooldown_multiplier.max(1.0),
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
    /// Bumped per admitted trial so a stale permit cannot free a newer slot.
    trial_epoch: u64,
}

impl Inner {
    fn release_trial(&mut self, epoch: Option<u64>) {
        if epoch == Some(self.trial_epoch) {
            self.trial_in_flight = false;
        }
    }
}

/// Circuit breaker shared by clones.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<BreakerConfig>,
    inner: Arc<Mutex<Inner>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let cooldown = config.cooldown;
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                cooldown,
                trial_in_flight: false,
                trial_epoch: 0,
            })),
        }
    }

    pub fn from_section(section: &CircuitBreakerSection) -> Self {
        Self::new(BreakerConfig::from_section(section))
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Ask for admission. While open this fails immediately without waiting.
    pub fn try_acquire(&self) -> Result<Permit, CircuitOpen> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let reopen_at = inner.opened_at.unwrap_or(now) + inner.cooldown;
                if now < reopen_at {
                    return Err(CircuitOpen {
                        retry_after: reopen_at - now,
                    });
                }
                inner.state = CircuitState::HalfOpen;
                tracing::info!(cooldown_ms = inner.cooldown.as_millis() as u64, "circuit half-open, admitting trial");
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(CircuitOpen {
                        retry_after: Duration::ZERO,
                    });
                }
                true
            }
        };

        let trial = trial.then(|| {
            inner.trial_in_flight = true;
            inner.trial_epoch = inner.trial_epoch.wrapping_add(1);
            inner.trial_epoch
        });

        Ok(Permit {
            breaker: self.clone(),
            trial,
            reported: false,
        })
    }

    /// Run `operation` under the breaker. Every error counts as a failure.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;
        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        let retry_after = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                Some((opened_at + inner.cooldown).saturating_duration_since(Instant::now()))
            }
            _ => None,
        };
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            cooldown: inner.cooldown,
            retry_after,
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.cooldown = self.config.cooldown;
        inner.trial_in_flight = false;
        tracing::info!("circuit reset");
    }

    fn on_success(&self, trial: Option<u64>) {
        let mut inner = self.inner.lock();
        inner.release_trial(trial);
        match inner.state {
            CircuitState::Open => {}
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.cooldown = self.config.cooldown;
                inner.trial_in_flight = false;
                tracing::info!(trial = trial.is_some(), "circuit closed after half-open success");
            }
            CircuitState::Closed => inner.consecutive_failures = 0,
        }
    }

    fn on_failure(&self, trial: Option<u64>) {
        let mut inner = self.inner.lock();
        inner.release_trial(trial);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                tracing::warn!(
                    failures = inner.consecutive_failures,
                    cooldown_ms = inner.cooldown.as_millis() as u64,
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                let grown = inner.cooldown.mul_f64(self.config.cooldown_multiplier);
                inner.cooldown = grown.min(self.config.max_cooldown);
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                tracing::warn!(
                    trial = trial.is_some(),
                    cooldown_ms = inner.cooldown.as_millis() as u64,
                    "half-open call failed, circuit reopened"
                );
            }
            _ => {}
        }
    }

    fn on_abandon(&self, trial: Option<u64>) {
        if trial.is_some() {
            self.inner.lock().release_trial(trial);
        }
    }
}

/// Admission ticket from [`CircuitBreaker::try_acquire`].
///
/// Report the outcome with [`success`](Permit::success) or
/// [`failure`](Permit::failure). A permit dropped unreported counts as
/// neither and frees the half-open trial slot.
#[must_use = "report the outcome with success() or failure()"]
pub struct Permit {
    breaker: CircuitBreaker,
    /// Epoch of the half-open slot this permit holds, if it is the trial.
    trial: Option<u64>,
    reported: bool,
}

impl Permit {
    /// Whether this permit is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    pub fn success(mut self) {
        self.reported = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.reported {
            self.breaker.on_abandon(self.trial);
        }
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

mod opt_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(10),
            max_cooldown: Duration::from_secs(30),
            cooldown_multiplier: 2.0,
        })
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        cb.call(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        cb.call(|| async { Ok::<(), &'static str>(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker(3);
        for _ in 0..2 {
            assert!(matches!(fail(&cb).await, Err(CircuitError::Inner("boom"))));
            assert_eq!(cb.state().state, CircuitState::Closed);
        }
        assert!(fail(&cb).await.is_err());
        let snap = cb.state();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.consecutive_failures, 3);
        assert_eq!(snap.retry_after, Some(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_running() {
        let cb = breaker(1);
        let _ = fail(&cb).await;

        let runs = AtomicU32::new(0);
        let result = cb
            .call(|| async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Open { .. })));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_success_closes() {
        let cb = breaker(1);
        let _ = fail(&cb).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(succeed(&cb).await.is_ok());

        let snap = cb.state();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.cooldown, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_grows_cooldown() {
        let cb = breaker(1);
        let _ = fail(&cb).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(fail(&cb).await, Err(CircuitError::Inner(_))));
        assert_eq!(cb.state().state, CircuitState::Open);
        assert_eq!(cb.state().cooldown, Duration::from_secs(20));

        // Still open just before the grown cooldown elapses.
        tokio::time::advance(Duration::from_secs(19)).await;
        assert!(matches!(succeed(&cb).await, Err(CircuitError::Open { .. })));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(fail(&cb).await, Err(CircuitError::Inner(_))));
        // 40s is capped at 30s.
        assert_eq!(cb.state().cooldown, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let cb = breaker(1);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let trial = cb.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.state().state, CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_err());

        // Abandoning the trial frees the slot without changing state.
        drop(trial);
        let trial = cb.try_acquire().unwrap();
        trial.success();
        assert_eq!(cb.state().state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_straggler_failure_while_half_open_reopens() {
        let cb = breaker(2);
        let straggler = cb.try_acquire().unwrap();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state().state, CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        let trial = cb.try_acquire().unwrap();
        assert_eq!(cb.state().state, CircuitState::HalfOpen);

        straggler.failure();
        let snap = cb.state();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.cooldown, Duration::from_secs(20));
        assert_eq!(snap.retry_after, Some(Duration::from_secs(20)));

        // The trial reporting late cannot close a reopened breaker.
        trial.success();
        assert_eq!(cb.state().state, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_straggler_success_while_half_open_closes() {
        let cb = breaker(2);
        let straggler = cb.try_acquire().unwrap();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        let trial = cb.try_acquire().unwrap();
        straggler.success();

        let snap = cb.state();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.cooldown, Duration::from_secs(10));

        // A stale trial failing afterwards counts as an ordinary failure.
        trial.failure();
        let snap = cb.state();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_trial_cannot_free_newer_slot() {
        let cb = breaker(1);
        let straggler = cb.try_acquire().unwrap();
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let stale = cb.try_acquire().unwrap();
        straggler.failure();
        tokio::time::advance(Duration::from_secs(20)).await;

        let fresh = cb.try_acquire().unwrap();
        assert!(fresh.is_trial());
        drop(stale);
        assert!(cb.try_acquire().is_err());

        drop(fresh);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state().consecutive_failures, 0);

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state().state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let cb = breaker(1);
        let _ = fail(&cb).await;
        assert_eq!(cb.state().state, CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state().state, CircuitState::Closed);
        assert!(succeed(&cb).await.is_ok());
    }

    #[test]
    fn test_snapshot_serializes_millis() {
        let cb = breaker(3);
        let json = serde_json::to_value(cb.state()).unwrap();
        assert_eq!(json["state"], "closed");
        assert_eq!(json["cooldown"], 10_000);
        assert!(json["retry_after"].is_null());
    }
}
