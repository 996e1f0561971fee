//! Kernel error types
//!
//! Every syscall returns a single `i32`: a non-negative success value or one
//! of the negative codes below. The numeric values are part of the contract
//! with user-space modules.

use thiserror::Error;

pub const EACCES: i32 = -1;
pub const EEXIST: i32 = -2;
pub const EINVAL: i32 = -4;
pub const EMAX: i32 = -5;
pub const ENOENT: i32 = -6;
pub const EQUEUE_EMPTY: i32 = -7;
pub const EQUEUE_FULL: i32 = -8;
pub const ENOMEM: i32 = -22;

/// Errors that can occur when interacting with the kernel
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum KernelError {
    /// Malformed argument, wrong state, or unknown object (EINVAL)
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Wrong owning process or insufficient domain/access rights (EACCES)
    #[error("Access denied: {0}")]
    AccessDenied(&'static str),

    /// Object already registered (EEXIST)
    #[error("Already exists: {0}")]
    AlreadyExists(&'static str),

    /// No free slot in a fixed-size table (EMAX)
    #[error("Resource exhausted: {0}")]
    Exhausted(&'static str),

    /// No resource manager serves the path (ENOENT)
    #[error("Not found: {0}")]
    NotFound(&'static str),

    /// Non-blocking receive on an empty queue
    #[error("Queue empty")]
    QueueEmpty,

    /// Non-blocking send on a full queue
    #[error("Queue full")]
    QueueFull,

    /// Heap exhausted
    #[error("Out of memory")]
    OutOfMemory,
}

impl KernelError {
    /// Returns the wire value of this error
    pub fn code(&self) -> i32 {
        match self {
            KernelError::InvalidArgument(_) => EINVAL,
            KernelError::AccessDenied(_) => EACCES,
            KernelError::AlreadyExists(_) => EEXIST,
            KernelError::Exhausted(_) => EMAX,
            KernelError::NotFound(_) => ENOENT,
            KernelError::QueueEmpty => EQUEUE_EMPTY,
            KernelError::QueueFull => EQUEUE_FULL,
            KernelError::OutOfMemory => ENOMEM,
        }
    }

    /// Decodes a negative wire value
    ///
    /// Returns `None` for success values and for codes this kernel never
    /// produces.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            EACCES => Some(KernelError::AccessDenied("")),
            EEXIST => Some(KernelError::AlreadyExists("")),
            EINVAL => Some(KernelError::InvalidArgument("")),
            EMAX => Some(KernelError::Exhausted("")),
            ENOENT => Some(KernelError::NotFound("")),
            EQUEUE_EMPTY => Some(KernelError::QueueEmpty),
            EQUEUE_FULL => Some(KernelError::QueueFull),
            ENOMEM => Some(KernelError::OutOfMemory),
            _ => None,
        }
    }
}

impl From<ipc::WireError> for KernelError {
    fn from(_: ipc::WireError) -> Self {
        KernelError::InvalidArgument("malformed IPC record")
    }
}

/// Folds a syscall result into its wire value
pub fn result_code(result: Result<i32, KernelError>) -> i32 {
    match result {
        Ok(value) => value,
        Err(error) => error.code(),
    }
}
