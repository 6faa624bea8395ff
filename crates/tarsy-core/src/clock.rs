//! Microsecond UTC timestamps and unique identifiers.
//!
//! Kept as an injectable capability (rather than a bare `Utc::now()` call
//! sprinkled through the codebase) so that the scheduler, controllers and
//! history service can be driven by a frozen clock in tests without any
//! `sleep`-based flakiness.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use uuid::Uuid;

/// Microseconds since the Unix epoch, UTC.
pub type MicroTimestamp = i64;

/// Source of time and identifiers for the whole core.
///
/// Every component that needs "now" or a fresh id takes `Arc<dyn Clock>`
/// instead of calling into `chrono`/`uuid` directly.
pub trait Clock: Send + Sync {
    /// Current time, microseconds since the Unix epoch.
    fn now_us(&self) -> MicroTimestamp;

    /// A fresh, globally unique identifier (session id, stage execution id,
    /// interaction id, ...).
    fn new_id(&self) -> String;
}

/// Real wall-clock time backed by the OS clock and random UUIDv4s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> MicroTimestamp {
        let now = Utc::now();
        now.timestamp_micros()
    }

    fn new_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Deterministic clock for tests: time only advances when explicitly told to,
/// and ids are a predictable, monotonically increasing sequence.
pub struct FrozenClock {
    now_us: AtomicI64,
    next_id: AtomicI64,
    prefix: String,
}

impl FrozenClock {
    pub fn new(start_us: MicroTimestamp) -> Self {
        Self {
            now_us: AtomicI64::new(start_us),
            next_id: AtomicI64::new(0),
            prefix: "test".to_string(),
        }
    }

    pub fn with_prefix(start_us: MicroTimestamp, prefix: impl Into<String>) -> Self {
        Self {
            now_us: AtomicI64::new(start_us),
            next_id: AtomicI64::new(0),
            prefix: prefix.into(),
        }
    }

    /// Advance the clock by `delta_us` microseconds, returning the new value.
    pub fn advance(&self, delta_us: i64) -> MicroTimestamp {
        self.now_us.fetch_add(delta_us, Ordering::SeqCst) + delta_us
    }
}

impl Clock for FrozenClock {
    fn now_us(&self) -> MicroTimestamp {
        self.now_us.load(Ordering::SeqCst)
    }

    fn new_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{}-{n:06}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_clock_ids_are_sequential_and_unique() {
        let clock = FrozenClock::new(0);
        let a = clock.new_id();
        let b = clock.new_id();
        assert_ne!(a, b);
        assert!(a.ends_with("000000"));
        assert!(b.ends_with("000001"));
    }

    #[test]
    fn frozen_clock_time_only_moves_on_advance() {
        let clock = FrozenClock::new(1_000);
        assert_eq!(clock.now_us(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_us(), 1_500);
    }
}
