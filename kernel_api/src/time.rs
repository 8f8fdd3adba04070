//! Time abstractions
//!
//! Kernel time is counted in scheduler ticks. A tick is whatever unit the
//! platform timer reports consumption in; quotas, fill quanta and timeout
//! deadlines all share it.

use core::ops::{Add, Sub};
use serde::{Deserialize, Serialize};

/// A point in kernel time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Instant {
    ticks: u64,
}

impl Instant {
    pub const ZERO: Instant = Instant { ticks: 0 };

    pub const fn from_ticks(ticks: u64) -> Self {
        Self { ticks }
    }

    pub const fn as_ticks(&self) -> u64 {
        self.ticks
    }

    /// Returns the duration since another instant, zero if `earlier` is later
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration::from_ticks(self.ticks.saturating_sub(earlier.ticks))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, duration: Duration) -> Self::Output {
        Instant::from_ticks(self.ticks.saturating_add(duration.as_ticks()))
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, duration: Duration) -> Self::Output {
        Instant::from_ticks(self.ticks.saturating_sub(duration.as_ticks()))
    }
}

/// A span of kernel time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Duration {
    ticks: u64,
}

impl Duration {
    pub const ZERO: Duration = Duration { ticks: 0 };

    pub const fn from_ticks(ticks: u64) -> Self {
        Self { ticks }
    }

    pub const fn as_ticks(&self) -> u64 {
        self.ticks
    }
}

impl Add for Duration {
    type Output = Duration;

    fn add(self, other: Duration) -> Self::Output {
        Duration::from_ticks(self.ticks.saturating_add(other.ticks))
    }
}

impl Sub for Duration {
    type Output = Duration;

    fn sub(self, other: Duration) -> Self::Output {
        Duration::from_ticks(self.ticks.saturating_sub(other.ticks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instant_arithmetic() {
        let start = Instant::from_ticks(100);
        let later = start + Duration::from_ticks(50);
        assert_eq!(later.as_ticks(), 150);
        assert_eq!(later.duration_since(start), Duration::from_ticks(50));
        assert_eq!(start.duration_since(later), Duration::ZERO);
        assert_eq!((start - Duration::from_ticks(500)), Instant::ZERO);
    }

    #[test]
    fn test_duration_arithmetic() {
        let a = Duration::from_ticks(30);
        let b = Duration::from_ticks(12);
        assert_eq!((a + b).as_ticks(), 42);
        assert_eq!((b - a), Duration::ZERO);
    }
}
