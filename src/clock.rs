//! Wall-clock and monotonic time as an injectable capability.
//!
//! Components never call `Utc::now()` directly; they hold an `Arc<dyn Clock>`
//! so tests can drive TTL expiry and timestamps deterministically.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
    /// Monotonic instant for elapsed-time measurements.
    fn monotonic(&self) -> Instant;
}

/// Production clock backed by the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock {
    base_instant: Instant,
    state: Mutex<ManualState>,
}

struct ManualState {
    now: DateTime<Utc>,
    offset: Duration,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            base_instant: Instant::now(),
            state: Mutex::new(ManualState {
                now: start,
                offset: Duration::ZERO,
            }),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock().expect("clock lock poisoned");
        state.now += chrono::Duration::from_std(by).expect("advance out of range");
        state.offset += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().expect("clock lock poisoned").now
    }

    fn monotonic(&self) -> Instant {
        let offset = self.state.lock().expect("clock lock poisoned").offset;
        self.base_instant + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_both_sources() {
        let clock = ManualClock::new(Utc::now());
        let wall = clock.now();
        let mono = clock.monotonic();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now() - wall, chrono::Duration::seconds(90));
        assert_eq!(clock.monotonic() - mono, Duration::from_secs(90));
    }
}
