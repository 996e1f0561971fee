//! # Simulated Timer Device
//!
//! Deterministic microsecond counter for testing.
//!
//! The counter only advances when the kernel's `advance_time` tells it to,
//! so every timer firing in a test is reproducible.

use hal::TimerDevice;
use kernel_api::{Duration, Instant};

/// Simulated timer device with controllable time progression
///
/// # Examples
///
/// ```
/// use sim_kernel::timer::SimTimerDevice;
/// use hal::TimerDevice;
/// use kernel_api::Duration;
///
/// let mut timer = SimTimerDevice::new();
/// assert_eq!(timer.poll_ticks(), 0);
///
/// timer.advance(Duration::from_millis(1));
/// assert_eq!(timer.poll_ticks(), 1_000);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SimTimerDevice {
    /// Microseconds since boot
    ticks: u64,
}

impl SimTimerDevice {
    /// Creates a new simulated timer starting at tick 0
    pub fn new() -> Self {
        Self { ticks: 0 }
    }

    /// Creates a timer that has already run for `ticks` microseconds
    pub fn with_initial_ticks(ticks: u64) -> Self {
        Self { ticks }
    }

    /// Advances the counter, saturating at `u64::MAX`
    pub fn advance(&mut self, duration: Duration) {
        self.ticks = self.ticks.saturating_add(duration.as_micros());
    }

    /// Returns the counter without requiring mutable access
    pub fn current_ticks(&self) -> u64 {
        self.ticks
    }

    /// Returns the counter as an [`Instant`]
    pub fn now(&self) -> Instant {
        Instant::from_micros(self.ticks)
    }
}

impl TimerDevice for SimTimerDevice {
    fn poll_ticks(&mut self) -> u64 {
        self.ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_timer_starts_at_zero() {
        let mut timer = SimTimerDevice::new();
        assert_eq!(timer.poll_ticks(), 0);
        assert_eq!(timer.now(), Instant::ZERO);
    }

    #[test]
    fn test_advance_accumulates() {
        let mut timer = SimTimerDevice::new();
        timer.advance(Duration::from_micros(100));
        timer.advance(Duration::from_micros(50));
        assert_eq!(timer.poll_ticks(), 150);
    }

    #[test]
    fn test_advance_saturates() {
        let mut timer = SimTimerDevice::with_initial_ticks(u64::MAX - 10);
        timer.advance(Duration::from_micros(500));
        assert_eq!(timer.current_ticks(), u64::MAX);
    }

    #[test]
    fn test_deterministic_sequence() {
        let mut timer1 = SimTimerDevice::new();
        let mut timer2 = SimTimerDevice::new();

        for delta in [10, 20, 5, 100, 3] {
            timer1.advance(Duration::from_micros(delta));
            timer2.advance(Duration::from_micros(delta));
        }

        assert_eq!(timer1.poll_ticks(), timer2.poll_ticks());
        assert_eq!(timer1.poll_ticks(), 138);
    }
}
