//! Wall clock and logical timestamp sources.
//!
//! Keep-alive and timeout bookkeeping reads a [`Clock`]; begin and commit
//! timestamps come from a [`TimestampSource`]. Both are traits so tests can
//! drive time by hand.

use crate::types::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond wall clock.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `start` milliseconds.
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute reading.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Source of begin and commit timestamps.
pub trait TimestampSource: Send + Sync {
    /// Returns a timestamp strictly greater than every one returned before.
    fn next_timestamp(&self) -> Timestamp;

    /// Returns the most recently issued timestamp.
    fn current(&self) -> Timestamp;
}

/// Single-process monotonic counter.
#[derive(Debug, Default)]
pub struct MonotonicTimestampSource {
    last: AtomicU64,
}

impl MonotonicTimestampSource {
    /// Creates a source whose first timestamp is `last + 1`.
    #[must_use]
    pub fn starting_after(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }
}

impl TimestampSource for MonotonicTimestampSource {
    fn next_timestamp(&self) -> Timestamp {
        Timestamp::new(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn current(&self) -> Timestamp {
        Timestamp::new(self.last.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_millis(), 100);
        clock.advance(50);
        assert_eq!(clock.now_millis(), 150);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }

    #[test]
    fn timestamps_are_strictly_increasing() {
        let source = MonotonicTimestampSource::default();
        let a = source.next_timestamp();
        let b = source.next_timestamp();
        assert_eq!(a, Timestamp::new(1));
        assert!(b > a);
        assert_eq!(source.current(), b);

        let resumed = MonotonicTimestampSource::starting_after(41);
        assert_eq!(resumed.next_timestamp(), Timestamp::new(42));
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
