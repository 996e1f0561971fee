//! # Kernel API
//!
//! This crate defines the interface between device modules and the kernel.
//!
//! ## Philosophy
//!
//! The kernel provides **mechanisms**, not policies:
//! - Threads with fixed priority ceilings
//! - Message queues and resource managers (not shared state)
//! - Explicit time (microsecond counter, timers that post messages)
//! - Per-process memory protection checked on every IPC buffer
//!
//! ## Design Goals
//!
//! 1. **Testability**: The entire API can be driven by a simulated kernel
//! 2. **Explicitness**: Every call acts for the running thread; blocking is visible
//! 3. **Stable numbers**: syscall numbers and error codes are a wire contract
//!
//! ## Non-Goals
//!
//! This is NOT:
//! - POSIX (no fork, exec, signals)
//! - A device protocol layer (payload buffers are opaque)

pub mod error;
pub mod kernel;
pub mod syscalls;
pub mod time;

pub use error::{
    result_code, KernelError, EACCES, EEXIST, EINVAL, EMAX, ENOENT, ENOMEM, EQUEUE_EMPTY,
    EQUEUE_FULL,
};
pub use kernel::{Blocking, Completion, IpcCall, KernelApi, ThreadParams};
pub use syscalls::{ArgLocation, SyscallNumber, REGISTER_ARGS};
pub use time::{Duration, Instant};
