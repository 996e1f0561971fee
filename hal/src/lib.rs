//! # Hardware Abstraction Layer (HAL)
//!
//! This crate defines the hardware seams of the kernel.
//!
//! ## Philosophy
//!
//! **The nucleus never touches a register directly.**
//!
//! Interrupt masking, the cross-processor mailbox and the timer are reached
//! only through these traits, so the whole kernel can run against simulated
//! devices in a host test.
//!
//! ## Design Principles
//!
//! 1. **Trait-based**: All hardware operations go through traits
//! 2. **Scoped masking**: interrupts are disabled by a guard, restored on drop
//! 3. **Testable**: every trait has a simulated implementation

pub mod interrupts;
pub mod mailbox;
pub mod timer;

pub use interrupts::{CriticalSection, InterruptHal, SharedInterrupts};
pub use mailbox::{MailboxControl, MailboxHal, MAILBOX_IRQ};
pub use timer::TimerDevice;
