//! # Cross-Processor Relay
//!
//! Bridges the hardware mailbox to the IPC transport. The external
//! processor is treated as process 15: its requests are dispatched like any
//! other caller's, except that every address it names must fall inside the
//! fast-RAM or cached-RAM window, and the completion token is the address of
//! its own request record.
//!
//! Replies are re-tagged in place and queued in a bounded outbound ring.
//! One entry is transmitted per `READY` edge from the external side. A reply
//! that finds the ring full parks its replier until a slot frees.

use crate::audit::KernelEvent;
use crate::message_queue::PostOutcome;
use crate::thread::{BlockedOp, WaitSite};
use crate::thread_queue::ThreadQueue;
use crate::transport::Origin;
use crate::SimulatedKernel;
use core_types::{Fd, ProcessId, QueueId, ThreadId};
use hal::{MailboxControl, MailboxHal};
use ipc::{IpcRequest, RequestPayload, REQUEST_SIZE};
use kernel_api::{Blocking, IpcCall, KernelError, EACCES};
use log::{debug, warn};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MailboxRegisters {
    control: MailboxControl,
    inbound: u32,
    outbound: u32,
}

/// In-process mailbox shared between the kernel and a test playing the
/// external processor
///
/// Clones share the same registers.
#[derive(Debug, Clone)]
pub struct SimMailbox {
    registers: Arc<Mutex<MailboxRegisters>>,
}

impl SimMailbox {
    /// A mailbox whose external side is ready for the first reply
    pub fn new() -> Self {
        let registers = MailboxRegisters {
            control: MailboxControl::READY | MailboxControl::IRQ_ENABLE,
            ..Default::default()
        };
        Self {
            registers: Arc::new(Mutex::new(registers)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MailboxRegisters> {
        self.registers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// External side: posts the address of a request record
    pub fn post_request(&self, record: u32) {
        let mut regs = self.lock();
        regs.inbound = record;
        regs.control |= MailboxControl::INCOMING;
    }

    /// External side: consumes the pending reply and signals readiness
    pub fn take_reply(&self) -> Option<u32> {
        let mut regs = self.lock();
        if !regs.control.contains(MailboxControl::OUTGOING) {
            return None;
        }
        regs.control.remove(MailboxControl::OUTGOING);
        regs.control |= MailboxControl::READY;
        Some(regs.outbound)
    }

    pub fn control_bits(&self) -> MailboxControl {
        self.lock().control
    }
}

impl Default for SimMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl MailboxHal for SimMailbox {
    fn control(&self) -> MailboxControl {
        self.lock().control
    }

    fn acknowledge(&mut self, bits: MailboxControl) {
        self.lock().control.remove(bits);
    }

    fn raise(&mut self, bits: MailboxControl) {
        self.lock().control.insert(bits);
    }

    fn inbound(&self) -> u32 {
        self.lock().inbound
    }

    fn set_outbound(&mut self, message: u32) {
        self.lock().outbound = message;
    }
}

/// Relay state owned by the kernel
pub struct Relay {
    mailbox: Box<dyn MailboxHal>,
    outbound: VecDeque<u32>,
    capacity: usize,
    /// Repliers waiting for ring space
    pub(crate) backlog: ThreadQueue,
    /// Replies with no thread to park, waiting for ring space
    pub(crate) deferred: VecDeque<u32>,
    /// Dispatched external requests whose queue was full
    pub(crate) stalled: VecDeque<(QueueId, u32)>,
}

impl Relay {
    pub fn new(mailbox: Box<dyn MailboxHal>, capacity: usize) -> Self {
        Self {
            mailbox,
            outbound: VecDeque::with_capacity(capacity),
            capacity,
            backlog: ThreadQueue::fifo(),
            deferred: VecDeque::new(),
            stalled: VecDeque::new(),
        }
    }

    /// Replies waiting for transmission, oldest first
    pub fn outbound(&self) -> impl Iterator<Item = u32> + '_ {
        self.outbound.iter().copied()
    }

    pub fn backlog(&self) -> &ThreadQueue {
        &self.backlog
    }

    pub fn stalled(&self) -> usize {
        self.stalled.len()
    }
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("outbound", &self.outbound)
            .field("capacity", &self.capacity)
            .field("backlog", &self.backlog.len())
            .field("deferred", &self.deferred)
            .field("stalled", &self.stalled)
            .finish_non_exhaustive()
    }
}

impl SimulatedKernel {
    /// Mailbox interrupt service
    pub(crate) fn service_mailbox(&mut self) {
        let control = self.relay.mailbox.control();
        if control.contains(MailboxControl::INCOMING) {
            let record = self.relay.mailbox.inbound();
            self.relay.mailbox.acknowledge(MailboxControl::INCOMING);
            self.accept_external(record);
        }
        self.flush_outbound();
    }

    fn accept_external(&mut self, record: u32) {
        if !self
            .config
            .external_window_contains(record, REQUEST_SIZE as u32)
        {
            warn!("relay request {:#010x} outside the shared windows", record);
            self.kernel_events.record(KernelEvent::RelayRejected {
                record,
                result: EACCES,
            });
            return;
        }

        let dispatched = self.external_call(record).and_then(|call| {
            self.dispatch(ProcessId::EXTERNAL, call, Origin::External { record })
        });
        let (message, queue) = match dispatched {
            Ok(routed) => routed,
            Err(error) => {
                debug!("relay request {:#010x} rejected: {}", record, error);
                self.kernel_events.record(KernelEvent::RelayRejected {
                    record,
                    result: error.code(),
                });
                self.retag_record(record, error.code());
                self.relay_reply(record, None);
                return;
            }
        };
        match self.post_message(queue, message, false) {
            Ok(PostOutcome::Delivered | PostOutcome::Queued) => {}
            Ok(PostOutcome::Full) => {
                self.note_queue_full(queue, message);
                self.relay.stalled.push_back((queue, message));
            }
            Err(error) => {
                self.complete_request(message, error.code(), None);
            }
        }
    }

    /// Decodes an external record into a call
    fn external_call(&self, record: u32) -> Result<IpcCall, KernelError> {
        let bytes = self.memory.read_bytes(record, REQUEST_SIZE);
        let request = IpcRequest::decode(&bytes)?;
        let fd = Fd::from_raw(request.handle as u32);
        let call = match request.payload {
            RequestPayload::Open { path, mode, .. } => {
                // The path is scanned before its length is known
                if !self.config.external_window_contains(path, 1) {
                    return Err(KernelError::AccessDenied("path outside the shared windows"));
                }
                IpcCall::Open { path, mode }
            }
            RequestPayload::Close => IpcCall::Close { fd },
            RequestPayload::Read { data, length } => IpcCall::Read { fd, data, length },
            RequestPayload::Write { data, length } => IpcCall::Write { fd, data, length },
            RequestPayload::Seek { offset, whence } => IpcCall::Seek { fd, offset, whence },
            RequestPayload::Ioctl {
                ioctl,
                input,
                input_len,
                output,
                output_len,
            } => IpcCall::Ioctl {
                fd,
                ioctl,
                input,
                input_len,
                output,
                output_len,
            },
            RequestPayload::Ioctlv {
                ioctl,
                input_count,
                io_count,
                vectors,
            } => IpcCall::Ioctlv {
                fd,
                ioctl,
                input_count,
                io_count,
                vectors,
            },
            RequestPayload::Reply => {
                return Err(KernelError::InvalidArgument("reply posted as a request"))
            }
        };
        Ok(call)
    }

    /// Queues a re-tagged external record for transmission
    ///
    /// With the ring full the replying thread waits in the relay backlog;
    /// kernel-originated replies are deferred instead.
    pub(crate) fn relay_reply(&mut self, record: u32, replier: Option<ThreadId>) -> Blocking<()> {
        if self.relay.outbound.len() < self.relay.capacity {
            self.relay.outbound.push_back(record);
            self.flush_outbound();
            return Blocking::Done(());
        }
        warn!("relay ring full, reply {:#010x} backlogged", record);
        self.kernel_events
            .record(KernelEvent::RelayBacklogged { record });
        match replier {
            Some(_) => {
                self.park_current(WaitSite::RelayBacklog, Some(BlockedOp::Relay { record }));
                Blocking::Suspended
            }
            None => {
                self.relay.deferred.push_back(record);
                Blocking::Done(())
            }
        }
    }

    /// Transmits one reply if the external side is ready, then refills the ring
    pub(crate) fn flush_outbound(&mut self) {
        let control = self.relay.mailbox.control();
        if control.contains(MailboxControl::READY) && !control.contains(MailboxControl::OUTGOING) {
            if let Some(record) = self.relay.outbound.pop_front() {
                self.relay.mailbox.set_outbound(record);
                self.relay.mailbox.acknowledge(MailboxControl::READY);
                self.relay.mailbox.raise(MailboxControl::OUTGOING);
                debug!("relay reply {:#010x} sent", record);
            }
        }

        while self.relay.outbound.len() < self.relay.capacity {
            if let Some(record) = self.relay.deferred.pop_front() {
                self.relay.outbound.push_back(record);
                continue;
            }
            let Some(thread) = self.relay.backlog.pop_front() else {
                break;
            };
            if let Some(BlockedOp::Relay { record }) =
                self.scheduler.thread(thread).and_then(|t| t.blocked)
            {
                self.relay.outbound.push_back(record);
            }
            self.wake(thread, 0);
        }
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }
}

#[cfg(test)]
mod tests {
    use crate::audit::KernelEvent;
    use crate::test_utils::TestSystem;
    use hal::{MailboxControl, MAILBOX_IRQ};
    use ipc::{Command, IpcRequest, RawIpcRequest, RequestPayload};
    use kernel_api::{KernelApi, EACCES, EINVAL};

    /// Writes an external open of `path` into fast RAM
    fn external_open(sys: &mut TestSystem, path: &str) -> u32 {
        let name = sys.write_cstr_shared(path);
        let record = sys.alloc_shared(0x20);
        let request = IpcRequest::new(
            0,
            RequestPayload::Open {
                path: name,
                mode: 1,
                uid: 0,
                gid: 0,
            },
        );
        sys.kernel.memory_mut().write_bytes(record, &request.encode());
        record
    }

    fn reply_of(sys: &TestSystem, record: u32) -> RawIpcRequest {
        RawIpcRequest::read(&sys.kernel.memory().read_bytes(record, 0x20)).unwrap()
    }

    #[test]
    fn test_external_open_round_trip() {
        let mut sys = TestSystem::new();
        let (rm, _queue, out) = sys.serve(1, "/dev/x", 4);
        let record = external_open(&mut sys, "/dev/x");

        sys.mailbox.post_request(record);
        sys.kernel.raise_interrupt(MAILBOX_IRQ);
        assert!(!sys.mailbox.control_bits().contains(MailboxControl::INCOMING));

        sys.focus(rm);
        let message = sys.kernel.memory().read_u32(out);
        let decoded = sys.kernel.read_message(message).unwrap();
        assert_eq!(decoded.caller_data, record);
        assert_eq!(decoded.used_by_thread, None);
        sys.kernel.resource_reply(message, 9).unwrap();

        assert_eq!(sys.mailbox.take_reply(), Some(record));
        let reply = reply_of(&sys, record);
        assert_eq!(reply.command.get(), Command::Reply.as_u32());
        assert_eq!(reply.handle.get(), Command::Open.as_u32() as i32);
        // The external side gets an fd of its own table
        assert_eq!(reply.result.get(), 0);
    }

    #[test]
    fn test_hidden_device_answered_immediately() {
        let mut sys = TestSystem::new();
        sys.serve(1, "/dev/aes", 4);
        sys.focus(sys.main);
        sys.kernel.set_external_access("/dev/aes", false).unwrap();
        let record = external_open(&mut sys, "/dev/aes");

        sys.mailbox.post_request(record);
        sys.kernel.raise_interrupt(MAILBOX_IRQ);
        assert_eq!(sys.mailbox.take_reply(), Some(record));
        assert_eq!(reply_of(&sys, record).result.get(), EACCES);
        assert_eq!(sys.kernel.in_flight_count(), 0);
        assert!(sys
            .kernel
            .kernel_events()
            .has_event(|e| matches!(e, KernelEvent::RelayRejected { result: EACCES, .. })));
    }

    #[test]
    fn test_record_outside_windows_is_dropped() {
        let mut sys = TestSystem::new();
        sys.mailbox.post_request(0x0200_0000);
        sys.kernel.raise_interrupt(MAILBOX_IRQ);
        assert_eq!(sys.mailbox.take_reply(), None);
        assert_eq!(sys.kernel.memory().read_u32(0x0200_0000 + 4), 0);
    }

    #[test]
    fn test_buffer_outside_windows_rejected() {
        let mut sys = TestSystem::new();
        let (rm, _queue, out) = sys.serve(1, "/dev/x", 4);
        let record = external_open(&mut sys, "/dev/x");
        sys.mailbox.post_request(record);
        sys.kernel.raise_interrupt(MAILBOX_IRQ);
        sys.focus(rm);
        let message = sys.kernel.memory().read_u32(out);
        sys.kernel.resource_reply(message, 1).unwrap();
        assert_eq!(sys.mailbox.take_reply(), Some(record));

        let write = sys.alloc_shared(0x20);
        let request = IpcRequest::new(0, RequestPayload::Write { data: 0x0200_0000, length: 16 });
        sys.kernel.memory_mut().write_bytes(write, &request.encode());
        sys.mailbox.post_request(write);
        sys.kernel.raise_interrupt(MAILBOX_IRQ);
        assert_eq!(sys.mailbox.take_reply(), Some(write));
        assert_eq!(reply_of(&sys, write).result.get(), EACCES);
    }

    #[test]
    fn test_external_io_on_unknown_fd() {
        let mut sys = TestSystem::new();
        let record = sys.alloc_shared(0x20);
        let request = IpcRequest::new(5, RequestPayload::Close);
        sys.kernel.memory_mut().write_bytes(record, &request.encode());
        sys.mailbox.post_request(record);
        sys.kernel.raise_interrupt(MAILBOX_IRQ);
        assert_eq!(sys.mailbox.take_reply(), Some(record));
        assert_eq!(reply_of(&sys, record).result.get(), EINVAL);
    }

    #[test]
    fn test_one_reply_per_ready_edge() {
        let mut sys = TestSystem::new();
        let (rm, queue, out) = sys.serve(1, "/dev/x", 4);
        let records: Vec<u32> = (0..2).map(|_| external_open(&mut sys, "/dev/x")).collect();
        for &record in &records {
            sys.mailbox.post_request(record);
            sys.kernel.raise_interrupt(MAILBOX_IRQ);
        }

        sys.focus(rm);
        let first = sys.kernel.memory().read_u32(out);
        sys.kernel.resource_reply(first, 1).unwrap();
        sys.focus(rm);
        let second = sys.kernel.receive_message(queue, out, 0).unwrap().done().unwrap();
        sys.focus(rm);
        sys.kernel.resource_reply(second, 2).unwrap();

        // The second reply waits until the external side takes the first
        assert_eq!(sys.kernel.relay().outbound().collect::<Vec<_>>(), vec![records[1]]);
        assert_eq!(sys.mailbox.take_reply(), Some(records[0]));
        assert_eq!(sys.mailbox.take_reply(), None);
        sys.kernel.raise_interrupt(MAILBOX_IRQ);
        assert_eq!(sys.mailbox.take_reply(), Some(records[1]));
    }

    #[test]
    fn test_full_ring_backlogs_replier() {
        let mut sys = TestSystem::with_config(crate::KernelConfig {
            relay_ring_capacity: 1,
            ..Default::default()
        });
        let (rm, queue, out) = sys.serve(1, "/dev/x", 4);
        let records: Vec<u32> = (0..3).map(|_| external_open(&mut sys, "/dev/x")).collect();
        for &record in &records {
            sys.mailbox.post_request(record);
            sys.kernel.raise_interrupt(MAILBOX_IRQ);
        }

        sys.focus(rm);
        let first = sys.kernel.memory().read_u32(out);
        sys.kernel.resource_reply(first, 1).unwrap();
        sys.focus(rm);
        let second = sys.kernel.receive_message(queue, out, 0).unwrap().done().unwrap();
        sys.focus(rm);
        sys.kernel.resource_reply(second, 2).unwrap();
        sys.focus(rm);
        let third = sys.kernel.receive_message(queue, out, 0).unwrap().done().unwrap();
        sys.focus(rm);
        assert!(sys.kernel.resource_reply(third, 3).unwrap().is_suspended());
        assert!(sys.kernel.relay().backlog().contains(rm));
        assert!(sys
            .kernel
            .kernel_events()
            .has_event(|e| matches!(e, KernelEvent::RelayBacklogged { .. })));
        assert!(sys.kernel.check_invariants().is_ok());

        assert_eq!(sys.mailbox.take_reply(), Some(records[0]));
        sys.kernel.raise_interrupt(MAILBOX_IRQ);
        assert_eq!(sys.context(rm).return_value(), 0);
        assert!(sys.kernel.relay().backlog().is_empty());
        assert_eq!(sys.mailbox.take_reply(), Some(records[1]));
        sys.kernel.raise_interrupt(MAILBOX_IRQ);
        assert_eq!(sys.mailbox.take_reply(), Some(records[2]));
    }

    #[test]
    fn test_full_queue_stalls_external_request() {
        let mut sys = TestSystem::new();
        let (rm, queue, out) = sys.serve(1, "/dev/x", 1);
        // First request goes straight to the waiting server, second fills the ring
        let records: Vec<u32> = (0..3).map(|_| external_open(&mut sys, "/dev/x")).collect();
        for &record in &records {
            sys.mailbox.post_request(record);
            sys.kernel.raise_interrupt(MAILBOX_IRQ);
        }
        assert_eq!(sys.kernel.relay().stalled(), 1);

        sys.focus(rm);
        let first = sys.kernel.memory().read_u32(out);
        sys.kernel.resource_reply(first, 1).unwrap();
        sys.focus(rm);
        sys.kernel.receive_message(queue, out, 0).unwrap();
        // The freed slot went to the stalled request
        assert_eq!(sys.kernel.relay().stalled(), 0);
        assert_eq!(sys.kernel.queue(queue).unwrap().len(), 1);
    }
}
