//! Clock abstraction
//!
//! The node core never reads wall-clock time directly; it asks a `Clock`
//! handed in at construction. Production uses `SystemClock`; tests drive a
//! manual clock so beacon-grace logic is deterministic.

use serde::{Deserialize, Serialize};
use std::ops::Add;
use std::time::{Duration, Instant};

/// A monotonic timestamp, measured from an arbitrary per-process origin.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Stamp(Duration);

impl Stamp {
    /// The process origin
    #[must_use]
    pub const fn zero() -> Self {
        Self(Duration::ZERO)
    }

    #[must_use]
    pub const fn from_duration(d: Duration) -> Self {
        Self(d)
    }

    /// Elapsed time since `earlier`, zero if `earlier` is in the future
    #[must_use]
    pub fn saturating_since(&self, earlier: Stamp) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    #[must_use]
    pub const fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Add<Duration> for Stamp {
    type Output = Stamp;

    fn add(self, rhs: Duration) -> Stamp {
        Stamp(self.0 + rhs)
    }
}

/// Source of monotonic timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Stamp;
}

/// Production clock backed by `Instant`.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Stamp {
        Stamp(self.origin.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_arithmetic() {
        let a = Stamp::from_duration(Duration::from_secs(10));
        let b = a + Duration::from_secs(5);
        assert_eq!(b.saturating_since(a), Duration::from_secs(5));
        assert_eq!(a.saturating_since(b), Duration::ZERO);
        assert!(b > a);
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
