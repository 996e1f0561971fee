//! The syscall table
//!
//! Syscall numbers are the binary contract with user-space modules and must
//! not be renumbered. A call passes its first four arguments in `r0..r3`;
//! argument five onward are words on the caller's stack, starting at `sp`.

use serde::{Deserialize, Serialize};

/// Arguments passed in registers
pub const REGISTER_ARGS: usize = 4;

macro_rules! syscall_table {
    ($($name:ident = $number:literal, $arity:literal;)*) => {
        /// Syscall numbers
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u32)]
        pub enum SyscallNumber {
            $($name = $number,)*
        }

        impl SyscallNumber {
            /// Every syscall, in table order
            pub const ALL: &'static [SyscallNumber] = &[$(SyscallNumber::$name,)*];

            /// Looks up a raw syscall number
            pub fn from_raw(raw: u32) -> Option<Self> {
                match raw {
                    $($number => Some(SyscallNumber::$name),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(SyscallNumber::$name => stringify!($name),)*
                }
            }

            /// Number of argument words the call consumes
            pub fn arity(self) -> usize {
                match self {
                    $(SyscallNumber::$name => $arity,)*
                }
            }
        }
    };
}

syscall_table! {
    CreateThread = 0x00, 6;
    JoinThread = 0x01, 2;
    CancelThread = 0x02, 2;
    GetThreadId = 0x03, 0;
    GetProcessId = 0x04, 0;
    StartThread = 0x05, 1;
    SuspendThread = 0x06, 1;
    YieldThread = 0x07, 0;
    GetThreadPriority = 0x08, 1;
    SetThreadPriority = 0x09, 2;
    CreateMessageQueue = 0x0A, 2;
    DestroyMessageQueue = 0x0B, 1;
    SendMessage = 0x0C, 3;
    JamMessage = 0x0D, 3;
    ReceiveMessage = 0x0E, 3;
    RegisterEventHandler = 0x0F, 3;
    UnregisterEventHandler = 0x10, 1;
    CreateTimer = 0x11, 4;
    RestartTimer = 0x12, 3;
    StopTimer = 0x13, 1;
    DestroyTimer = 0x14, 1;
    GetTime = 0x15, 0;
    CreateHeap = 0x16, 2;
    DestroyHeap = 0x17, 1;
    AllocateOnHeap = 0x18, 2;
    AllocateAlignedOnHeap = 0x19, 3;
    FreeOnHeap = 0x1A, 2;
    RegisterResourceManager = 0x1B, 2;
    OpenFd = 0x1C, 2;
    CloseFd = 0x1D, 1;
    ReadFd = 0x1E, 3;
    WriteFd = 0x1F, 3;
    SeekFd = 0x20, 3;
    IoctlFd = 0x21, 6;
    IoctlvFd = 0x22, 5;
    OpenFdAsync = 0x23, 4;
    CloseFdAsync = 0x24, 3;
    ReadFdAsync = 0x25, 5;
    WriteFdAsync = 0x26, 5;
    SeekFdAsync = 0x27, 5;
    IoctlFdAsync = 0x28, 8;
    IoctlvFdAsync = 0x29, 7;
    ResourceReply = 0x2A, 2;
    SetUid = 0x2B, 2;
    GetUid = 0x2C, 0;
    SetGid = 0x2D, 2;
    GetGid = 0x2E, 0;
}

impl SyscallNumber {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Where a syscall argument lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    /// Register `r{n}`
    Register(usize),
    /// Big-endian word at `sp + offset`
    Stack { offset: u32 },
}

impl ArgLocation {
    /// Locates the zero-based argument `index`
    pub fn of(index: usize) -> Self {
        if index < REGISTER_ARGS {
            ArgLocation::Register(index)
        } else {
            ArgLocation::Stack {
                offset: ((index - REGISTER_ARGS) * 4) as u32,
            }
        }
    }
}
