//! Device event handlers
//!
//! Each interrupt line can be bound to one queue and a fixed message. When
//! the line fires the message is sent without blocking; a full queue loses
//! the event and says so. The mailbox line is serviced by the relay instead.

use crate::audit::KernelEvent;
use crate::message_queue::PostOutcome;
use crate::SimulatedKernel;
use core_types::{ProcessId, QueueId};
use hal::MAILBOX_IRQ;
use kernel_api::KernelError;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

/// Interrupt lines the kernel knows about
pub const MAX_DEVICES: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHandler {
    pub queue: QueueId,
    pub message: u32,
    pub owner: ProcessId,
}

impl SimulatedKernel {
    pub(crate) fn sys_register_event_handler(
        &mut self,
        device: u32,
        queue: QueueId,
        message: u32,
    ) -> Result<(), KernelError> {
        self.caller()?;
        let owner = self.caller_process();
        if device >= MAX_DEVICES {
            return Err(KernelError::InvalidArgument("no such device"));
        }
        self.check_queue_access(queue, owner)?;
        let slot = &mut self.events[device as usize];
        if slot.is_some() {
            return Err(KernelError::AlreadyExists("device already has a handler"));
        }
        *slot = Some(EventHandler {
            queue,
            message,
            owner,
        });
        info!("device {} handled by {} for {}", device, queue, owner);
        Ok(())
    }

    pub(crate) fn sys_unregister_event_handler(&mut self, device: u32) -> Result<(), KernelError> {
        self.caller()?;
        let process = self.caller_process();
        let slot = self
            .events
            .get_mut(device as usize)
            .ok_or(KernelError::InvalidArgument("no such device"))?;
        match *slot {
            Some(handler) if handler.owner == process || process.is_kernel() => {
                *slot = None;
                Ok(())
            }
            Some(_) => Err(KernelError::AccessDenied("handler belongs to another process")),
            None => Err(KernelError::InvalidArgument("no handler registered")),
        }
    }

    pub(crate) fn remove_event_handlers_for(&mut self, queue: QueueId) {
        for slot in self.events.iter_mut() {
            if slot.is_some_and(|h| h.queue == queue) {
                *slot = None;
            }
        }
    }

    /// Delivers an interrupt on `device`
    ///
    /// # Panics
    ///
    /// Panics on a line outside the interrupt controller's range; the
    /// kernel cannot tell which device raised it.
    pub fn raise_interrupt(&mut self, device: u32) {
        if device >= MAX_DEVICES {
            error!("interrupt from unknown source {}", device);
            panic!("unclassifiable interrupt source {device}");
        }
        if device == MAILBOX_IRQ {
            self.service_mailbox();
        } else if let Some(handler) = self.events[device as usize] {
            match self.post_message(handler.queue, handler.message, false) {
                Ok(PostOutcome::Delivered | PostOutcome::Queued) => {}
                Ok(PostOutcome::Full) | Err(_) => {
                    warn!("event from device {} lost: {} full", device, handler.queue);
                    self.kernel_events.record(KernelEvent::EventLost {
                        device,
                        queue: handler.queue,
                    });
                }
            }
        }
        self.preempt_if_needed();
    }

    pub fn event_handler(&self, device: u32) -> Option<EventHandler> {
        self.events.get(device as usize).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use crate::audit::KernelEvent;
    use crate::test_utils::TestSystem;
    use kernel_api::{Blocking, KernelApi, EACCES, EEXIST, EINVAL};

    #[test]
    fn test_interrupt_wakes_handler_thread() {
        let mut sys = TestSystem::new();
        let driver = sys.spawn(1, 90);
        let buffer = sys.alloc(1, 8);
        let out = sys.alloc(1, 4);
        let queue = sys.kernel.create_message_queue(buffer, 2).unwrap();
        sys.kernel.register_event_handler(5, queue, 0xE5).unwrap();
        assert_eq!(sys.kernel.receive_message(queue, out, 0).unwrap(), Blocking::Suspended);

        sys.kernel.raise_interrupt(5);
        assert_eq!(sys.kernel.thread_id(), driver);
        assert_eq!(sys.kernel.memory().read_u32(out), 0xE5);
    }

    #[test]
    fn test_full_queue_loses_event() {
        let mut sys = TestSystem::new();
        let buffer = sys.alloc_kernel(4);
        let queue = sys.kernel.create_message_queue(buffer, 1).unwrap();
        sys.kernel.register_event_handler(3, queue, 1).unwrap();
        sys.kernel.raise_interrupt(3);
        sys.kernel.raise_interrupt(3);
        assert_eq!(sys.kernel.queue(queue).unwrap().len(), 1);
        assert_eq!(
            sys.kernel
                .kernel_events()
                .count_events(|e| matches!(e, KernelEvent::EventLost { device: 3, .. })),
            1
        );
    }

    #[test]
    fn test_registration_rules() {
        let mut sys = TestSystem::new();
        let buffer = sys.alloc_kernel(4);
        let queue = sys.kernel.create_message_queue(buffer, 1).unwrap();
        assert_eq!(sys.kernel.register_event_handler(32, queue, 0).unwrap_err().code(), EINVAL);
        sys.kernel.register_event_handler(4, queue, 0).unwrap();
        assert_eq!(sys.kernel.register_event_handler(4, queue, 0).unwrap_err().code(), EEXIST);

        let user = sys.spawn(2, 10);
        sys.focus(user);
        assert_eq!(sys.kernel.unregister_event_handler(4).unwrap_err().code(), EACCES);
        sys.focus(sys.main);
        sys.kernel.unregister_event_handler(4).unwrap();
        assert!(sys.kernel.event_handler(4).is_none());
        assert_eq!(sys.kernel.unregister_event_handler(4).unwrap_err().code(), EINVAL);
    }

    #[test]
    fn test_unhandled_line_is_ignored() {
        let mut sys = TestSystem::new();
        sys.kernel.raise_interrupt(7);
        assert!(sys.kernel.check_invariants().is_ok());
    }

    #[test]
    #[should_panic(expected = "unclassifiable")]
    fn test_unknown_line_panics() {
        let mut sys = TestSystem::new();
        sys.kernel.raise_interrupt(40);
    }
}
