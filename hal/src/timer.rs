//! # Timer Device
//!
//! Hardware abstraction for the kernel's microsecond counter.
//!
//! The kernel polls this counter to decide which timers are due; it never
//! sleeps on it.

/// Hardware timer device trait
///
/// Ticks are microseconds, monotonic and cumulative since boot.
///
/// # Examples
///
/// ```
/// use hal::TimerDevice;
///
/// fn elapsed<T: TimerDevice>(timer: &mut T, since: u64) -> u64 {
///     timer.poll_ticks().saturating_sub(since)
/// }
/// ```
pub trait TimerDevice {
    /// Returns the current tick count
    fn poll_ticks(&mut self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestTimer {
        ticks: u64,
    }

    impl TimerDevice for TestTimer {
        fn poll_ticks(&mut self) -> u64 {
            self.ticks
        }
    }

    #[test]
    fn test_timer_cumulative() {
        let mut timer = TestTimer { ticks: 0 };
        assert_eq!(timer.poll_ticks(), 0);

        timer.ticks += 100;
        assert_eq!(timer.poll_ticks(), 100);

        timer.ticks += 200;
        assert_eq!(timer.poll_ticks(), 300);
    }
}
