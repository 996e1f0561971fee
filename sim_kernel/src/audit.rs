//! Audit logs
//!
//! Every subsystem records its decisions in an append-only log so tests can
//! assert on what the kernel did, not only on what it returned.

use core_types::{QueueId, ThreadId, TimerId};
use serde::{Deserialize, Serialize};

/// Append-only log of audit events
#[derive(Debug, Clone)]
pub struct AuditLog<E> {
    events: Vec<E>,
}

impl<E> AuditLog<E> {
    /// Creates a new empty audit log
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Records an event
    pub fn record(&mut self, event: E) {
        self.events.push(event);
    }

    /// Returns all recorded events
    pub fn events(&self) -> &[E] {
        &self.events
    }

    /// Clears all events
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Checks if an event matching the predicate exists
    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&E) -> bool,
    {
        self.events.iter().any(predicate)
    }

    /// Counts events matching the predicate
    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&E) -> bool,
    {
        self.events.iter().filter(|e| predicate(e)).count()
    }
}

impl<E> Default for AuditLog<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport-level events that are not errors of any single call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelEvent {
    /// A send found the queue full; the sender was backpressured
    QueueFull { queue: QueueId, message: u32 },
    /// A reply waits for room in the outbound relay ring
    RelayBacklogged { record: u32 },
    /// An external request was answered without dispatch
    RelayRejected { record: u32, result: i32 },
    /// A reply arrived for a caller that stopped waiting; it was discarded
    OrphanedReply { message: u32, thread: ThreadId },
    /// An interrupt message was dropped on a full queue
    EventLost { device: u32, queue: QueueId },
    /// A timer message did not fit and will be retried
    TimerDeferred { timer: TimerId, queue: QueueId },
    /// A queue was destroyed along with the resource managers bound to it
    QueueDestroyed { queue: QueueId, managers_dropped: usize },
}
