//! Exponential backoff with jitter.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total invocations, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Exponential base applied per attempt.
    pub base: f64,
    /// Multiply each delay by a random factor in [0.5, 1.5).
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            base: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("not retryable: {0}")]
    NotRetryable(E),
    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::NotRetryable(e) | Self::Exhausted { source: e, .. } => e,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt `attempt`
    /// (0-indexed): `min(max, initial * base^attempt)`, jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay.as_secs_f64() * self.base.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.5..1.5)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * factor)
    }

    /// Invoke `op` until it succeeds, a non-retryable failure surfaces, or
    /// `max_attempts` invocations are spent.
    pub async fn run<T, E, F, Fut>(
        &self,
        op_name: &str,
        mut op: F,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt: u32 = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !retryable(&e) => return Err(RetryError::NotRetryable(e)),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    let delay = self.delay_for(attempt - 1);
                    tracing::warn!(
                        op = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
