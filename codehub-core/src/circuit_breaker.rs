//! Circuit breaker for external service calls (Docker Runtime, S3), shared
//! by WC, Scheduler, and the Proxy so all three agree on when a dependency
//! is failing fast. Ported from the source's `CircuitBreaker` state machine.

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::retry::ErrorClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error)]
#[error("circuit open for {service}, retry after {retry_after_secs:.1}s")]
pub struct CircuitOpenError {
    pub service: String,
    pub retry_after_secs: f64,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, success_threshold: u32, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            success_threshold,
            timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    fn check_state_transition(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            if let Some(last_failure) = inner.last_failure_at {
                if last_failure.elapsed() >= self.timeout {
                    info!(name = %self.name, "circuit transitioning OPEN -> HALF_OPEN");
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                }
            }
        }
    }

    /// Runs `f` if the circuit allows it, otherwise fails fast. Every error
    /// counts toward the failure threshold; callers whose error type
    /// distinguishes transient from permanent failures should use
    /// [`Self::call_classified`] instead (spec §7).
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(f, |_| ErrorClass::Transient).await
    }

    /// Runs `f` if the circuit allows it, otherwise fails fast. Only an
    /// error `classify` reports as [`ErrorClass::Transient`] counts toward
    /// the failure/success thresholds -- a permanent error (bad input,
    /// access denied) says nothing about whether the dependency itself is
    /// healthy, so it must not trip the breaker the way a flaky one does
    /// (spec §7: "classify through a common helper so that WC, Scheduler,
    /// and Proxy all agree on what is retryable").
    pub async fn call_classified<T, E, F, Fut>(
        &self,
        f: F,
        classify: impl FnOnce(&E) -> ErrorClass,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        {
            let mut inner = self.inner.lock();
            self.check_state_transition(&mut inner);
            if inner.state == CircuitState::Open {
                let retry_after = inner
                    .last_failure_at
                    .map(|t| (self.timeout.saturating_sub(t.elapsed())).as_secs_f64())
                    .unwrap_or(0.0);
                warn!(name = %self.name, retry_after, "circuit OPEN, rejecting request");
                return Err(CallError::CircuitOpen(CircuitOpenError {
                    service: self.name.clone(),
                    retry_after_secs: retry_after.max(0.0),
                }));
            }
        }

        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                if classify(&err) == ErrorClass::Transient {
                    self.on_failure();
                }
                Err(CallError::Inner(err))
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    info!(name = %self.name, "circuit transitioning HALF_OPEN -> CLOSED");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                warn!(name = %self.name, "circuit transitioning HALF_OPEN -> OPEN");
                inner.state = CircuitState::Open;
            }
            CircuitState::Closed => {
                if inner.failure_count >= self.failure_threshold {
                    warn!(name = %self.name, failures = inner.failure_count, "circuit transitioning CLOSED -> OPEN");
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }
}

#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error(transparent)]
    CircuitOpen(CircuitOpenError),
    #[error(transparent)]
    Inner(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ok() -> Result<(), &'static str> {
        Ok(())
    }
    async fn fail() -> Result<(), &'static str> {
        Err("boom")
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let cb = CircuitBreaker::new("external", 3, 2, Duration::from_secs(30));
        for _ in 0..3 {
            let _ = cb.call(|| fail()).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_calling_inner() {
        let cb = CircuitBreaker::new("external", 1, 1, Duration::from_secs(30));
        let _ = cb.call(|| fail()).await;
        assert_eq!(cb.state(), CircuitState::Open);
        let result = cb.call(|| ok()).await;
        assert!(matches!(result, Err(CallError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn success_in_closed_state_resets_failure_count() {
        let cb = CircuitBreaker::new("external", 3, 1, Duration::from_secs(30));
        let _ = cb.call(|| fail()).await;
        let _ = cb.call(|| ok()).await;
        let _ = cb.call(|| fail()).await;
        let _ = cb.call(|| fail()).await;
        // Only 2 consecutive failures since the reset; threshold is 3.
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let cb = CircuitBreaker::new("external", 1, 2, Duration::from_millis(10));
        let _ = cb.call(|| fail()).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(15)).await;
        let _ = cb.call(|| ok()).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let _ = cb.call(|| ok()).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_circuit() {
        let cb = CircuitBreaker::new("external", 1, 2, Duration::from_millis(10));
        let _ = cb.call(|| fail()).await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        let _ = cb.call(|| ok()).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let _ = cb.call(|| fail()).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn permanent_errors_never_trip_the_breaker() {
        let cb = CircuitBreaker::new("external", 2, 1, Duration::from_secs(30));
        for _ in 0..5 {
            let _ = cb.call_classified(|| fail(), |_| ErrorClass::Permanent).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn transient_errors_still_trip_the_breaker_when_classified() {
        let cb = CircuitBreaker::new("external", 2, 1, Duration::from_secs(30));
        for _ in 0..2 {
            let _ = cb.call_classified(|| fail(), |_| ErrorClass::Transient).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
