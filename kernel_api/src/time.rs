//! Time abstractions
//!
//! The kernel timer counts microseconds. `GetTime` hands user space the low
//! 32 bits of the counter.

use core::ops::{Add, Sub};
use serde::{Deserialize, Serialize};

/// A point in time
///
/// Microseconds since boot. In the simulated kernel time only moves when a
/// test advances it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Instant {
    micros: u64,
}

impl Instant {
    /// Boot time
    pub const ZERO: Instant = Instant { micros: 0 };

    /// Creates an instant from microseconds since boot
    pub const fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    /// Returns microseconds since boot
    pub const fn as_micros(&self) -> u64 {
        self.micros
    }

    /// Returns the value `GetTime` reports
    pub const fn as_counter(&self) -> u32 {
        self.micros as u32
    }

    /// Returns the duration since another instant
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration::from_micros(self.micros.saturating_sub(earlier.micros))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, duration: Duration) -> Self::Output {
        Instant::from_micros(self.micros.saturating_add(duration.as_micros()))
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, duration: Duration) -> Self::Output {
        Instant::from_micros(self.micros.saturating_sub(duration.as_micros()))
    }
}

/// A duration of time, in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Duration {
    micros: u64,
}

impl Duration {
    pub const ZERO: Duration = Duration { micros: 0 };

    /// Creates a duration from microseconds
    pub const fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    /// Creates a duration from milliseconds
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            micros: millis * 1_000,
        }
    }

    /// Creates a duration from seconds
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            micros: secs * 1_000_000,
        }
    }

    /// Returns the duration in microseconds
    pub const fn as_micros(&self) -> u64 {
        self.micros
    }

    /// Returns the duration in milliseconds
    pub const fn as_millis(&self) -> u64 {
        self.micros / 1_000
    }

    pub const fn is_zero(&self) -> bool {
        self.micros == 0
    }
}

impl Add for Duration {
    type Output = Duration;

    fn add(self, other: Duration) -> Self::Output {
        Duration::from_micros(self.micros.saturating_add(other.micros))
    }
}

impl Sub for Duration {
    type Output = Duration;

    fn sub(self, other: Duration) -> Self::Output {
        Duration::from_micros(self.micros.saturating_sub(other.micros))
    }
}
