//! Time abstractions
//!
//! Kernel time is virtual: an opaque nanosecond counter that the platform
//! (or a test harness) advances. Timers are expressed against [`Instant`]s.

use core::ops::{Add, Sub};
use serde::{Deserialize, Serialize};

/// A point in kernel time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Instant {
    nanos: u64,
}

impl Instant {
    /// Creates an instant from nanoseconds since boot.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Returns nanoseconds since boot.
    pub const fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Returns the duration since an earlier instant (saturating).
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.nanos.saturating_sub(earlier.nanos))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, duration: Duration) -> Self::Output {
        Instant::from_nanos(self.nanos + duration.as_nanos())
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, duration: Duration) -> Self::Output {
        Instant::from_nanos(self.nanos.saturating_sub(duration.as_nanos()))
    }
}

/// A span of kernel time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Duration {
    nanos: u64,
}

impl Duration {
    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self {
            nanos: micros * 1_000,
        }
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis * 1_000_000,
        }
    }

    pub const fn as_nanos(&self) -> u64 {
        self.nanos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instant_arithmetic() {
        let start = Instant::from_nanos(100);
        let later = start + Duration::from_nanos(50);
        assert_eq!(later.as_nanos(), 150);
        assert_eq!(later.duration_since(start), Duration::from_nanos(50));
        assert_eq!((later - Duration::from_nanos(200)).as_nanos(), 0);
    }

    #[test]
    fn test_duration_conversions() {
        assert_eq!(Duration::from_micros(2).as_nanos(), 2_000);
        assert_eq!(Duration::from_millis(3).as_nanos(), 3_000_000);
    }

    #[test]
    fn test_ordering() {
        assert!(Instant::from_nanos(1) < Instant::from_nanos(2));
        assert!(Duration::from_nanos(5) > Duration::from_nanos(4));
    }
}
