//! Three-state circuit breaker.
//!
//! Closed: calls pass, counted failures accumulate, reaching the threshold
//! opens the breaker. Open: calls fail fast with `BreakerOpen` until the
//! open timeout elapses. Half-open: probes pass one at a time; the
//! configured number of consecutive successes closes the breaker, any
//! counted failure reopens it.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Counted failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Time the breaker stays open before admitting a probe.
    pub open_timeout: Duration,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{name}' is open")]
    Open { name: String, retry_after: Duration },
    #[error("{0}")]
    Inner(E),
}

/// Point-in-time breaker state for stats surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
}

struct BreakerInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
    /// Half-open admits exactly one call at a time.
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    cfg: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: BreakerConfig) -> Self {
        let name = name.into();
        tracing::info!(
            breaker = %name,
            failure_threshold = cfg.failure_threshold,
            open_timeout_s = cfg.open_timeout.as_secs(),
            success_threshold = cfg.success_threshold,
            "circuit breaker initialized"
        );
        Self {
            name,
            cfg,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
        }
    }

    /// Admission check. `Err(retry_after)` means the call must not proceed.
    fn try_acquire(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.cfg.open_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.successes = 0;
                    inner.probe_in_flight = true;
                    tracing::info!(breaker = %self.name, "circuit breaker half-open, probing");
                    Ok(())
                } else {
                    Err(self.cfg.open_timeout - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.cfg.open_timeout)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.successes += 1;
                if inner.successes >= self.cfg.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    tracing::info!(breaker = %self.name, "circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.last_failure = Some(Instant::now());
        inner.successes = 0;
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.cfg.failure_threshold {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failures,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.state = CircuitState::Open;
                tracing::warn!(breaker = %self.name, "probe failed, circuit breaker reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Release a half-open probe slot without changing state, used when a
    /// call finished with an uncounted (non-transient) failure.
    fn release_probe(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Run `op` under the breaker, counting every failure.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(op, |_| true).await
    }

    /// Run `op` under the breaker. Only failures where `counts` returns true
    /// touch breaker state; others pass through untouched.
    pub async fn call_classified<T, E, F, Fut>(
        &self,
        op: F,
        counts: impl Fn(&E) -> bool,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Err(retry_after) = self.try_acquire() {
            return Err(BreakerError::Open {
                name: self.name.clone(),
                retry_after,
            });
        }
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if counts(&e) {
                    self.record_failure();
                } else {
                    self.release_probe();
                }
                Err(BreakerError::Inner(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, open_timeout: Duration, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold,
                open_timeout,
                success_threshold,
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        b.call(|| async { Err::<(), _>("down") }).await.map(|_: ()| ())
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        b.call(|| async { Ok::<_, &'static str>(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn progression_closed_open_half_open_closed() {
        let b = breaker(5, Duration::from_secs(60), 2);

        // F consecutive failures open the breaker.
        for _ in 0..5 {
            assert!(matches!(fail(&b).await, Err(BreakerError::Inner(_))));
        }
        assert_eq!(b.snapshot().state, CircuitState::Open);

        // While open, calls fail fast.
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open { .. })));

        // After the open timeout, one probe is admitted.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.snapshot().state, CircuitState::HalfOpen);

        // S consecutive successes close it.
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.snapshot().state, CircuitState::Closed);
        assert_eq!(b.snapshot().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let b = breaker(1, Duration::from_secs(10), 2);
        let _ = fail(&b).await;
        assert_eq!(b.snapshot().state, CircuitState::Open);

        tokio::time::sleep(Duration::from_secs(11)).await;
        let _ = fail(&b).await;
        assert_eq!(b.snapshot().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn closed_success_resets_failure_count() {
        let b = breaker(3, Duration::from_secs(10), 1);
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        assert_eq!(b.snapshot().failures, 2);
        let _ = succeed(&b).await;
        assert_eq!(b.snapshot().failures, 0);
    }

    #[tokio::test]
    async fn uncounted_failures_leave_state_alone() {
        let b = breaker(1, Duration::from_secs(10), 1);
        let result = b
            .call_classified(|| async { Err::<(), _>("business outcome") }, |_| false)
            .await;
        assert!(matches!(result, Err(BreakerError::Inner(_))));
        assert_eq!(b.snapshot().state, CircuitState::Closed);
        assert_eq!(b.snapshot().failures, 0);
    }
}
