//! Strictly monotone wall-clock stamps.
//!
//! Sync correctness depends on every mutation stamp being unique and ordered:
//! a watermark taken under a graph lock must be strictly below every stamp
//! issued after the lock is released. `Utc::now()` alone can repeat or step
//! backwards, so stamps are clamped to at least one nanosecond past the last
//! stamp handed out.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// Shared source of strictly increasing timestamps.
#[derive(Debug, Default)]
pub struct Clock {
    last_nanos: AtomicI64,
}

impl Clock {
    /// Create a new clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next stamp: wall-clock time, or 1ns after the previous stamp.
    pub fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX - 1);
        let mut prev = self.last_nanos.load(Ordering::Acquire);
        loop {
            let next = wall.max(prev + 1);
            match self.last_nanos.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return DateTime::from_timestamp_nanos(next),
                Err(actual) => prev = actual,
            }
        }
    }

    /// Make sure future stamps are strictly after `at`.
    ///
    /// Used after loading snapshots written by a clock that ran ahead.
    pub fn observe(&self, at: DateTime<Utc>) {
        if let Some(nanos) = at.timestamp_nanos_opt() {
            self.last_nanos.fetch_max(nanos, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_stamps_strictly_increase() {
        let clock = Clock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_observe_future_stamp() {
        let clock = Clock::new();
        let future = Utc::now() + Duration::hours(1);
        clock.observe(future);
        assert!(clock.now() > future);
    }
}
