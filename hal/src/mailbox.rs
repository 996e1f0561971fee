//! # Cross-Processor Mailbox
//!
//! A pair of message registers plus a control register shared with the
//! external processor.
//!
//! - The external side writes a request address into the inbound register
//!   and raises `INCOMING`.
//! - The kernel writes a reply address into the outbound register and raises
//!   `OUTGOING`.
//! - The external side raises `READY` when it can take another reply.
//!
//! Status bits are acknowledged by writing them back (write-one-to-clear).

use bitflags::bitflags;

/// IRQ line the mailbox raises
pub const MAILBOX_IRQ: u32 = 30;

bitflags! {
    /// Control register bits
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct MailboxControl: u32 {
        /// The external side posted a request
        const INCOMING = 0x01;
        /// The kernel posted a reply not yet consumed
        const OUTGOING = 0x02;
        /// The external side is ready to receive (acknowledge)
        const READY = 0x04;
        /// Interrupt trigger enable
        const IRQ_ENABLE = 0x08;
    }
}

/// Mailbox register access
pub trait MailboxHal {
    /// Reads the control register
    fn control(&self) -> MailboxControl;

    /// Clears the given status bits
    fn acknowledge(&mut self, bits: MailboxControl);

    /// Sets the given control bits
    fn raise(&mut self, bits: MailboxControl);

    /// Reads the inbound message register
    fn inbound(&self) -> u32;

    /// Writes the outbound message register
    fn set_outbound(&mut self, message: u32);
}
