//! Simulated interrupt controller

use hal::InterruptHal;
use std::sync::atomic::{AtomicBool, Ordering};

/// Interrupt enable flag of the simulated CPU
///
/// Interrupts start enabled. The flag only changes through
/// [`hal::CriticalSection`] guards.
#[derive(Debug)]
pub struct SimInterruptController {
    enabled: AtomicBool,
}

impl SimInterruptController {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
        }
    }
}

impl Default for SimInterruptController {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptHal for SimInterruptController {
    fn enable_interrupts(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    fn disable_interrupts(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn interrupts_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}
