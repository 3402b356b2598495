//! Time source abstraction for commit timestamps.
//!
//! Commits are stamped in whole seconds. Production code reads the system
//! clock; tests use [`ManualTimeSource`] to get deterministic timestamps.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Abstraction over the clock.
pub trait TimeSource: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now_secs(&self) -> u32;
}

/// Real time source using the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    #[allow(clippy::cast_possible_truncation)] // u32 seconds last until 2106
    fn now_secs(&self) -> u32 {
        // Before 1970 counts as 0; the commit path never uses a timestamp
        // below the previous one plus one.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as u32)
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualTimeSource {
    current: AtomicU32,
}

impl ManualTimeSource {
    #[must_use]
    pub const fn new(initial_secs: u32) -> Self {
        Self {
            current: AtomicU32::new(initial_secs),
        }
    }

    pub fn advance(&self, secs: u32) {
        self.current.fetch_add(secs, Ordering::SeqCst);
    }

    /// Set the clock, possibly backwards.
    pub fn set(&self, secs: u32) {
        self.current.store(secs, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_secs(&self) -> u32 {
        self.current.load(Ordering::SeqCst)
    }
}

/// The timestamp for a commit following one stamped `last`: the current
/// time, but always strictly increasing and never zero.
#[must_use]
pub fn next_timestamp(clock: &dyn TimeSource, last: u32) -> u32 {
    clock.now_secs().max(last.saturating_add(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_time_source() {
        let source = SystemTimeSource;
        let t1 = source.now_secs();
        let t2 = source.now_secs();

        // After 2020-01-01
        assert!(t1 > 1_577_836_800);
        assert!(t2 >= t1);
    }

    #[test]
    fn test_manual_time_source() {
        let time = ManualTimeSource::new(1000);
        assert_eq!(time.now_secs(), 1000);
        time.advance(5);
        assert_eq!(time.now_secs(), 1005);
        time.set(10);
        assert_eq!(time.now_secs(), 10);
    }

    #[test]
    fn test_next_timestamp_is_strictly_increasing() {
        let time = ManualTimeSource::new(100);
        assert_eq!(next_timestamp(&time, 0), 100);
        assert_eq!(next_timestamp(&time, 100), 101);
        time.set(0);
        assert_eq!(next_timestamp(&time, 0), 1);
        assert_eq!(next_timestamp(&time, 41), 42);
    }
}
