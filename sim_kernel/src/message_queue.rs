//! # Message Queues
//!
//! Bounded rings of 32-bit messages with blocking senders and receivers.
//!
//! - A message posted while a receiver waits is handed to it directly.
//! - Receivers wait LIFO within a priority; senders blocked on a full ring
//!   wait FIFO and are admitted one per freed slot.
//! - A full ring is logged and backpressures the sender; nothing is dropped.
//!
//! Only the owning process (or the kernel) may use a queue.

use crate::audit::KernelEvent;
use crate::thread::{AfterSend, BlockedOp, WaitSite};
use crate::thread_queue::ThreadQueue;
use crate::SimulatedKernel;
use core_types::{AccessKind, ProcessId, QueueId};
use kernel_api::{Blocking, KernelError, EINVAL};
use log::{debug, warn};
use std::collections::VecDeque;

/// `flags` bit that turns a blocking call into a failing one
pub const NON_BLOCKING: u32 = 1;

/// A message queue
#[derive(Debug)]
pub struct MessageQueue {
    pub owner: ProcessId,
    /// Caller-supplied backing buffer
    pub buffer: u32,
    pub capacity: usize,
    ring: VecDeque<u32>,
    pub(crate) senders: ThreadQueue,
    pub(crate) receivers: ThreadQueue,
}

impl MessageQueue {
    pub fn new(owner: ProcessId, buffer: u32, capacity: usize) -> Self {
        Self {
            owner,
            buffer,
            capacity,
            ring: VecDeque::with_capacity(capacity),
            senders: ThreadQueue::fifo(),
            receivers: ThreadQueue::lifo(),
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.len() >= self.capacity
    }

    /// Queued messages, oldest first
    pub fn messages(&self) -> impl Iterator<Item = u32> + '_ {
        self.ring.iter().copied()
    }

    pub fn senders(&self) -> &ThreadQueue {
        &self.senders
    }

    pub fn receivers(&self) -> &ThreadQueue {
        &self.receivers
    }
}

/// Result of offering a message to a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    /// Handed to a waiting receiver
    Delivered,
    Queued,
    Full,
}

impl SimulatedKernel {
    pub(crate) fn queue_slot_mut(&mut self, queue: QueueId) -> Option<&mut MessageQueue> {
        self.queues.get_mut(queue.index()).and_then(Option::as_mut)
    }

    pub(crate) fn queue_ref(&self, queue: QueueId) -> Result<&MessageQueue, KernelError> {
        self.queues
            .get(queue.index())
            .and_then(Option::as_ref)
            .ok_or(KernelError::InvalidArgument("no such queue"))
    }

    /// Checks that `process` may use `queue`
    pub(crate) fn check_queue_access(
        &self,
        queue: QueueId,
        process: ProcessId,
    ) -> Result<(), KernelError> {
        let q = self.queue_ref(queue)?;
        if process.is_kernel() || q.owner == process {
            Ok(())
        } else {
            Err(KernelError::AccessDenied("queue belongs to another process"))
        }
    }

    /// Offers a message without blocking anyone
    pub(crate) fn post_message(
        &mut self,
        queue: QueueId,
        message: u32,
        jam: bool,
    ) -> Result<PostOutcome, KernelError> {
        let q = self
            .queue_slot_mut(queue)
            .ok_or(KernelError::InvalidArgument("no such queue"))?;
        if let Some(receiver) = q.receivers.pop_front() {
            let out = match self.scheduler.thread(receiver).and_then(|t| t.blocked) {
                Some(BlockedOp::Receive { out, .. }) => out,
                _ => 0,
            };
            if out != 0 {
                self.memory.write_u32(out, message);
            }
            self.note_delivered(queue, message);
            self.wake(receiver, 0);
            return Ok(PostOutcome::Delivered);
        }
        if q.is_full() {
            return Ok(PostOutcome::Full);
        }
        if jam {
            q.ring.push_front(message);
        } else {
            q.ring.push_back(message);
        }
        Ok(PostOutcome::Queued)
    }

    pub(crate) fn note_queue_full(&mut self, queue: QueueId, message: u32) {
        warn!("{} full, message {:#010x} backpressured", queue, message);
        self.kernel_events
            .record(KernelEvent::QueueFull { queue, message });
    }

    /// Lets the first blocked sender into a freed slot
    ///
    /// With no blocked sender, a relay request stalled on this queue gets
    /// the slot instead.
    fn admit_sender(&mut self, queue: QueueId) {
        let Some(q) = self.queue_slot_mut(queue) else {
            return;
        };
        if let Some(sender) = q.senders.pop_front() {
            let Some(BlockedOp::Send {
                message, jam, then, ..
            }) = self.scheduler.thread(sender).and_then(|t| t.blocked)
            else {
                self.wake(sender, EINVAL);
                return;
            };
            if let Some(q) = self.queue_slot_mut(queue) {
                if jam {
                    q.ring.push_front(message);
                } else {
                    q.ring.push_back(message);
                }
            }
            match then {
                AfterSend::Resume | AfterSend::Posted(_) => self.wake(sender, 0),
                AfterSend::AwaitReply(request) => {
                    self.rehome(sender, WaitSite::Reply(request), None)
                }
            }
        } else if let Some(position) = self.relay.stalled.iter().position(|(q, _)| *q == queue) {
            if let Some((_, message)) = self.relay.stalled.remove(position) {
                if let Some(q) = self.queue_slot_mut(queue) {
                    q.ring.push_back(message);
                }
            }
        }
    }

    fn send_or_jam(
        &mut self,
        queue: QueueId,
        message: u32,
        flags: u32,
        jam: bool,
    ) -> Result<Blocking<()>, KernelError> {
        self.caller()?;
        self.check_queue_access(queue, self.caller_process())?;
        match self.post_message(queue, message, jam)? {
            PostOutcome::Delivered | PostOutcome::Queued => {
                self.preempt_if_needed();
                Ok(Blocking::Done(()))
            }
            PostOutcome::Full => {
                self.note_queue_full(queue, message);
                if flags & NON_BLOCKING != 0 {
                    return Err(KernelError::QueueFull);
                }
                self.park_current(
                    WaitSite::Senders(queue),
                    Some(BlockedOp::Send {
                        queue,
                        message,
                        jam,
                        then: AfterSend::Resume,
                    }),
                );
                Ok(Blocking::Suspended)
            }
        }
    }

    pub(crate) fn sys_send_message(
        &mut self,
        queue: QueueId,
        message: u32,
        flags: u32,
    ) -> Result<Blocking<()>, KernelError> {
        self.send_or_jam(queue, message, flags, false)
    }

    pub(crate) fn sys_jam_message(
        &mut self,
        queue: QueueId,
        message: u32,
        flags: u32,
    ) -> Result<Blocking<()>, KernelError> {
        self.send_or_jam(queue, message, flags, true)
    }

    pub(crate) fn sys_receive_message(
        &mut self,
        queue: QueueId,
        out: u32,
        flags: u32,
    ) -> Result<Blocking<u32>, KernelError> {
        self.caller()?;
        let process = self.caller_process();
        if out == 0 {
            return Err(KernelError::InvalidArgument("null message pointer"));
        }
        self.mmu
            .check_memory_pointer(out, 4, AccessKind::Write, process, process)?;
        self.check_queue_access(queue, process)?;

        let popped = self.queue_slot_mut(queue).and_then(|q| q.ring.pop_front());
        match popped {
            Some(message) => {
                self.memory.write_u32(out, message);
                self.note_delivered(queue, message);
                self.admit_sender(queue);
                self.preempt_if_needed();
                Ok(Blocking::Done(message))
            }
            None if flags & NON_BLOCKING != 0 => Err(KernelError::QueueEmpty),
            None => {
                self.park_current(
                    WaitSite::Receivers(queue),
                    Some(BlockedOp::Receive { queue, out }),
                );
                Ok(Blocking::Suspended)
            }
        }
    }

    pub(crate) fn sys_create_message_queue(
        &mut self,
        buffer: u32,
        capacity: u32,
    ) -> Result<QueueId, KernelError> {
        self.caller()?;
        let process = self.caller_process();
        if capacity == 0 {
            return Err(KernelError::InvalidArgument("zero capacity"));
        }
        let bytes = capacity
            .checked_mul(4)
            .ok_or(KernelError::InvalidArgument("capacity overflows"))?;
        self.mmu
            .check_memory_pointer(buffer, bytes, AccessKind::Write, process, process)?;
        let slot = self
            .queues
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::Exhausted("message queue table"))?;
        self.queues[slot] = Some(MessageQueue::new(process, buffer, capacity as usize));
        let queue = QueueId::from_index(slot);
        debug!("{} created for {} ({} slots)", queue, process, capacity);
        Ok(queue)
    }

    /// Destroys a queue and everything that depends on it
    ///
    /// Waiters wake with EINVAL, resource managers, event handlers and timers
    /// bound to the queue disappear, and requests still queued on it are
    /// answered with EINVAL.
    pub(crate) fn sys_destroy_message_queue(&mut self, queue: QueueId) -> Result<(), KernelError> {
        self.caller()?;
        let q = self.queue_ref(queue)?;
        let process = self.caller_process();
        if q.owner != process && !process.is_kernel() {
            return Err(KernelError::AccessDenied("queue belongs to another process"));
        }
        let Some(mut q) = self.queues[queue.index()].take() else {
            return Err(KernelError::InvalidArgument("no such queue"));
        };

        for receiver in q.receivers.drain() {
            self.wake(receiver, EINVAL);
        }
        for sender in q.senders.drain() {
            if let Some(BlockedOp::Send { then, .. }) =
                self.scheduler.thread(sender).and_then(|t| t.blocked)
            {
                if let Some(request) = then.pending_request() {
                    self.abort_request(request);
                }
            }
            self.wake(sender, EINVAL);
        }

        let managers_dropped = self.registry.remove_bound_to(queue);
        self.remove_event_handlers_for(queue);
        self.remove_timers_for(queue);

        for message in q.ring.drain(..) {
            if self.in_flight.contains_key(&message) {
                self.complete_request(message, EINVAL, None);
            }
        }
        let stalled: Vec<u32> = self
            .relay
            .stalled
            .iter()
            .filter(|(q, _)| *q == queue)
            .map(|(_, m)| *m)
            .collect();
        self.relay.stalled.retain(|(q, _)| *q != queue);
        for message in stalled {
            self.complete_request(message, EINVAL, None);
        }

        self.kernel_events.record(KernelEvent::QueueDestroyed {
            queue,
            managers_dropped,
        });
        self.preempt_if_needed();
        Ok(())
    }
}
