//! Thread descriptors
//!
//! A thread is a slot in the scheduler's arena. Where a waiting thread is
//! parked, and what it will do when it wakes, are explicit fields rather
//! than implied by which list happens to link it.

use crate::thread_queue::ThreadQueue;
use core_types::{ProcessId, QueueId, ThreadId};
use serde::{Deserialize, Serialize};

/// CPSR value for user-mode threads
pub const CPSR_USER: u32 = 0x10;

/// CPSR value for kernel (pid 0) threads
pub const CPSR_SYSTEM: u32 = 0x1F;

/// Thread lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadState {
    /// Free slot
    Unset,
    Stopped,
    Ready,
    Running,
    Waiting,
    /// Cancelled, waiting to be joined
    Dead,
}

/// Saved register file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SavedContext {
    /// r0-r12
    pub gpr: [u32; 13],
    pub sp: u32,
    pub lr: u32,
    pub pc: u32,
    pub cpsr: u32,
}

impl SavedContext {
    /// The syscall result register
    pub fn return_value(&self) -> i32 {
        self.gpr[0] as i32
    }

    pub fn set_return_value(&mut self, value: i32) {
        self.gpr[0] = value as u32;
    }

    /// Reads `r{index}`; 13 is sp, 14 lr, 15 pc
    pub fn register(&self, index: usize) -> u32 {
        match index {
            0..=12 => self.gpr[index],
            13 => self.sp,
            14 => self.lr,
            _ => self.pc,
        }
    }

    pub fn set_register(&mut self, index: usize, value: u32) {
        match index {
            0..=12 => self.gpr[index] = value,
            13 => self.sp = value,
            14 => self.lr = value,
            _ => self.pc = value,
        }
    }
}

/// Where a thread is parked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitSite {
    /// Not in any queue (Running, Stopped, Dead or Unset)
    None,
    /// The global ready queue
    Ready,
    /// Receivers of an empty queue
    Receivers(QueueId),
    /// Senders to a full queue
    Senders(QueueId),
    /// Joiners of a thread
    Joiners(ThreadId),
    /// Waiting for the reply to the request at this message address
    Reply(u32),
    /// Replier waiting for room in the outbound relay ring
    RelayBacklog,
}

/// What a sender does once its message is in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AfterSend {
    /// Return 0 to the sender
    Resume,
    /// Return 0 once the asynchronous request at this address is queued
    Posted(u32),
    /// Keep waiting for the reply to the request at this address
    AwaitReply(u32),
}

impl AfterSend {
    /// The in-flight request still waiting for room in its queue
    pub fn pending_request(self) -> Option<u32> {
        match self {
            AfterSend::Resume => None,
            AfterSend::Posted(request) | AfterSend::AwaitReply(request) => Some(request),
        }
    }
}

/// The operation a waiting thread will complete on wake-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockedOp {
    Receive {
        queue: QueueId,
        out: u32,
    },
    Send {
        queue: QueueId,
        message: u32,
        jam: bool,
        then: AfterSend,
    },
    Join {
        target: ThreadId,
        out: u32,
    },
    /// A relay reply that did not fit in the outbound ring
    Relay {
        record: u32,
    },
}

/// One slot of the thread arena
#[derive(Debug, Clone)]
pub struct Thread {
    pub id: ThreadId,
    pub process: ProcessId,
    pub state: ThreadState,
    pub context: SavedContext,
    pub priority: u8,
    /// Ceiling for this thread and its children
    pub initial_priority: u8,
    pub detached: bool,
    pub return_value: i32,
    pub wait: WaitSite,
    pub blocked: Option<BlockedOp>,
    pub stack_top: u32,
    pub stack_size: u32,
    pub joiners: ThreadQueue,
}

impl Thread {
    /// An unused slot
    pub fn unset(id: ThreadId) -> Self {
        Self {
            id,
            process: ProcessId::KERNEL,
            state: ThreadState::Unset,
            context: SavedContext::default(),
            priority: 0,
            initial_priority: 0,
            detached: false,
            return_value: 0,
            wait: WaitSite::None,
            blocked: None,
            stack_top: 0,
            stack_size: 0,
            joiners: ThreadQueue::lifo(),
        }
    }

    pub fn is_unset(&self) -> bool {
        self.state == ThreadState::Unset
    }

    /// Returns the slot to the free pool
    pub fn release(&mut self) {
        *self = Thread::unset(self.id);
    }
}
