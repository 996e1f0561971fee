//! Interrupt masking abstraction

use std::sync::Arc;

/// Interrupt controller trait
///
/// The kernel is single-core; masking interrupts is how it makes a sequence
/// of table updates atomic.
pub trait InterruptHal {
    /// Enables interrupts
    fn enable_interrupts(&self);

    /// Disables interrupts
    fn disable_interrupts(&self);

    /// Returns whether interrupts are enabled
    fn interrupts_enabled(&self) -> bool;
}

/// Shared handle to the interrupt controller
pub type SharedInterrupts = Arc<dyn InterruptHal + Send + Sync>;

/// Guard that disables interrupts on creation and restores them on drop
///
/// Only the previous enable state is restored, so guards nest. Table
/// mutations that must be atomic take a `&CriticalSection` as proof that
/// one is open.
///
/// # Example
///
/// ```
/// use hal::{CriticalSection, InterruptHal, SharedInterrupts};
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
///
/// struct Flag(AtomicBool);
///
/// impl InterruptHal for Flag {
///     fn enable_interrupts(&self) { self.0.store(true, Ordering::SeqCst) }
///     fn disable_interrupts(&self) { self.0.store(false, Ordering::SeqCst) }
///     fn interrupts_enabled(&self) -> bool { self.0.load(Ordering::SeqCst) }
/// }
///
/// let irq: SharedInterrupts = Arc::new(Flag(AtomicBool::new(true)));
/// {
///     let _cs = CriticalSection::enter(&irq);
///     assert!(!irq.interrupts_enabled());
/// }
/// assert!(irq.interrupts_enabled());
/// ```
pub struct CriticalSection {
    hal: SharedInterrupts,
    were_enabled: bool,
}

impl CriticalSection {
    /// Disables interrupts until the guard is dropped
    pub fn enter(hal: &SharedInterrupts) -> Self {
        let were_enabled = hal.interrupts_enabled();
        hal.disable_interrupts();
        Self {
            hal: Arc::clone(hal),
            were_enabled,
        }
    }

    /// Returns whether interrupts were enabled before this guard
    pub fn was_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        if self.were_enabled {
            self.hal.enable_interrupts();
        }
    }
}
