//! Failure containment around external calls.
//!
//! Three cooperating pieces: a three-state circuit breaker, exponential
//! backoff with jitter, and a bounded dead-letter sink for work whose
//! retries are exhausted. [`Resilience::call`] composes them: the breaker
//! guards each attempt, transient failures are retried, `BreakerOpen` is
//! never retried, and exhaustion lands in the dead-letter sink.

pub mod breaker;
pub mod dead_letter;
pub mod retry;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;

pub use breaker::{BreakerConfig, BreakerError, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use dead_letter::{DeadLetterEntry, DeadLetterSink, DeadLetterStats};
pub use retry::{RetryError, RetryPolicy};

/// Failure of a composed resilient call.
#[derive(Debug)]
pub enum CallError<E> {
    /// Breaker refused the call without invoking the operation.
    Open { name: String, retry_after: Duration },
    /// Transient failures persisted through every attempt.
    Exhausted { attempts: u32, source: E },
    /// Non-transient failure, propagated from the first attempt.
    Rejected(E),
}

impl<E: Display> Display for CallError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { name, retry_after } => write!(
                f,
                "circuit breaker '{name}' is open (retry after {}s)",
                retry_after.as_secs()
            ),
            Self::Exhausted { attempts, source } => {
                write!(f, "retries exhausted after {attempts} attempts: {source}")
            }
            Self::Rejected(source) => write!(f, "{source}"),
        }
    }
}

impl<E: Display + std::fmt::Debug> std::error::Error for CallError<E> {}

/// Breaker + retry + dead-letter, wired once per guarded dependency.
#[derive(Clone)]
pub struct Resilience {
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    dead_letter: Arc<DeadLetterSink>,
    clock: Arc<dyn Clock>,
}

impl Resilience {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        dead_letter: Arc<DeadLetterSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            breaker,
            retry,
            dead_letter,
            clock,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn dead_letter(&self) -> &Arc<DeadLetterSink> {
        &self.dead_letter
    }

    /// Run `op` under the breaker, retrying transient failures with backoff.
    ///
    /// `transient` classifies failures: it decides both what the breaker
    /// counts and what is worth retrying. Business outcomes (a photo with no
    /// face) are not transient and propagate immediately without touching
    /// breaker state.
    pub async fn call<T, E, F, Fut>(
        &self,
        op_name: &str,
        mut op: F,
        transient: impl Fn(&E) -> bool,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt: u32 = 0;
        loop {
            match self.breaker.call_classified(|| op(), &transient).await {
                Ok(value) => return Ok(value),
                Err(BreakerError::Open { name, retry_after }) => {
                    // Never retried: the breaker already knows the
                    // dependency is down.
                    return Err(CallError::Open { name, retry_after });
                }
                Err(BreakerError::Inner(e)) if !transient(&e) => {
                    return Err(CallError::Rejected(e));
                }
                Err(BreakerError::Inner(e)) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        self.dead_letter.record(
                            op_name,
                            &e.to_string(),
                            serde_json::json!({ "attempts": attempt }),
                            self.clock.now(),
                        );
                        return Err(CallError::Exhausted {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    let delay = self.retry.delay_for(attempt - 1);
                    tracing::warn!(
                        op = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Like [`Self::call`], but consults `fallback` when the breaker is open
    /// or retries are exhausted. A `Some` from the fallback becomes the
    /// call's result; `None` surfaces the original failure.
    pub async fn call_with_fallback<T, E, F, Fut, FB, FbFut>(
        &self,
        op_name: &str,
        op: F,
        transient: impl Fn(&E) -> bool,
        fallback: FB,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> FbFut,
        FbFut: Future<Output = Option<T>>,
        E: Display,
    {
        match self.call(op_name, op, transient).await {
            Ok(value) => Ok(value),
            Err(err @ (CallError::Open { .. } | CallError::Exhausted { .. })) => {
                match fallback().await {
                    Some(value) => {
                        tracing::info!(op = op_name, "fallback satisfied the call");
                        Ok(value)
                    }
                    None => Err(err),
                }
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn harness(max_attempts: u32, failure_threshold: u32) -> Resilience {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Resilience::new(
            Arc::new(CircuitBreaker::new(
                "test",
                BreakerConfig {
                    failure_threshold,
                    open_timeout: Duration::from_secs(60),
                    success_threshold: 2,
                },
            )),
            RetryPolicy {
                max_attempts,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                base: 2.0,
                jitter: false,
            },
            Arc::new(DeadLetterSink::new(16)),
            clock,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_lands_in_dead_letter() {
        let resilience = harness(3, 100);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = resilience
            .call(
                "always-fails",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("boom") }
                },
                |_| true,
            )
            .await;

        assert!(matches!(result, Err(CallError::Exhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(resilience.dead_letter().stats().total, 1);
    }

    #[tokio::test]
    async fn non_transient_failures_propagate_immediately() {
        let resilience = harness(3, 100);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = resilience
            .call(
                "rejects",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("no face") }
                },
                |_| false,
            )
            .await;

        assert!(matches!(result, Err(CallError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Business outcomes never touch breaker counters.
        assert_eq!(resilience.breaker().snapshot().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_short_circuits_without_invoking() {
        let resilience = harness(1, 1);
        // Trip the breaker.
        let _ = resilience
            .call("trip", || async { Err::<(), _>("down") }, |_| true)
            .await;

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = resilience
            .call(
                "short-circuit",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                |_: &&str| true,
            )
            .await;

        assert!(matches!(result, Err(CallError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_covers_open_breaker() {
        let resilience = harness(1, 1);
        let _ = resilience
            .call("trip", || async { Err::<(), _>("down") }, |_| true)
            .await;

        let result = resilience
            .call_with_fallback(
                "with-fallback",
                || async { Err::<u32, _>("down") },
                |_| true,
                || async { Some(42) },
            )
            .await;

        assert_eq!(result.unwrap(), 42);
    }
}
