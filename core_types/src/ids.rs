//! Identifiers for kernel objects
//!
//! Every kernel object lives in a fixed-size table and is addressed by its
//! slot index. Identifiers are small `Copy` values so they can cross the
//! syscall boundary as plain register words.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of process ids the kernel tracks (ids `0..16`)
pub const MAX_PROCESSES: usize = 16;

/// Identifier for a process (a loaded module or the kernel itself)
///
/// Process 0 is the privileged kernel. Process 15 stands for the external
/// processor whose requests arrive through the hardware mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(u8);

impl ProcessId {
    /// The kernel process; exempt from memory-protection checks
    pub const KERNEL: ProcessId = ProcessId(0);

    /// The external processor, seen as a pseudo-process
    pub const EXTERNAL: ProcessId = ProcessId(15);

    /// Creates a process id, rejecting values outside the process table
    pub fn new(raw: u32) -> Option<Self> {
        if (raw as usize) < MAX_PROCESSES {
            Some(Self(raw as u8))
        } else {
            None
        }
    }

    /// Returns the raw id
    pub fn as_u32(self) -> u32 {
        self.0 as u32
    }

    /// Returns the table index
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns true for the kernel process
    pub fn is_kernel(self) -> bool {
        self == Self::KERNEL
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// Identifier for a thread
///
/// The id is the thread's slot in the kernel thread table. Id 0 is never
/// allocated; in syscalls it means "the calling thread".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(u16);

impl ThreadId {
    /// Alias for the calling thread
    pub const CURRENT: ThreadId = ThreadId(0);

    /// Creates a thread id from a raw syscall argument
    pub fn from_raw(raw: u32) -> Option<Self> {
        u16::try_from(raw).ok().map(Self)
    }

    /// Creates a thread id from a table index
    pub fn from_index(index: usize) -> Self {
        Self(index as u16)
    }

    /// Returns the raw id
    pub fn as_u32(self) -> u32 {
        self.0 as u32
    }

    /// Returns the table index
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns true if this is the "calling thread" alias
    pub fn is_current_alias(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

macro_rules! slot_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u32);

        impl $name {
            /// Creates an id from a table index
            pub const fn from_index(index: usize) -> Self {
                Self(index as u32)
            }

            /// Creates an id from a raw syscall argument
            pub const fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            /// Returns the raw id
            pub const fn as_u32(self) -> u32 {
                self.0
            }

            /// Returns the table index
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

slot_id!(
    /// Identifier for a message queue
    QueueId,
    "queue"
);

slot_id!(
    /// Per-process file descriptor bound to a resource manager
    Fd,
    "fd"
);

slot_id!(
    /// Identifier for a kernel timer
    TimerId,
    "timer"
);

slot_id!(
    /// Identifier for a user heap
    HeapId,
    "heap"
);

slot_id!(
    /// Identifier for a registered resource manager
    ResourceManagerId,
    "rm"
);
