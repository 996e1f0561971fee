//! # Inter-Process Communication (IPC)
//!
//! This crate defines Starling's IPC wire format.
//!
//! ## Philosophy
//!
//! - **Byte-exact**: records are laid out exactly as user-space modules and
//!   the external processor expect them, big-endian throughout
//! - **Typed at the edge**: raw records decode into enums once, at the kernel
//!   boundary, and are never poked by offset afterwards
//! - **Opaque payloads**: the kernel validates buffer addresses, never the
//!   bytes behind them
//!
//! ## Records
//!
//! - [`IpcRequest`]: the 0x20-byte request (command, result, fd, arguments)
//! - [`IpcMessage`]: a request plus delivery bookkeeping, 0x34 bytes
//! - [`IoVector`]: one entry of an Ioctlv vector array

pub mod message;
pub mod request;
pub mod vector;

use thiserror::Error;

pub use message::{IpcMessage, RawIpcMessage, MESSAGE_SIZE};
pub use request::{Command, IpcRequest, RawIpcRequest, RequestPayload, REQUEST_SIZE};
pub use vector::{IoVector, IO_VECTOR_SIZE, MAX_PATH_LEN};

/// Errors raised while decoding wire records
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    /// The command word is not a known IPC command
    #[error("Unknown IPC command: {0:#x}")]
    UnknownCommand(u32),

    /// Fewer bytes than the record needs
    #[error("Truncated record: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// A bookkeeping field holds an impossible value
    #[error("Bad field at offset {offset:#x}: {value:#x}")]
    BadField { offset: usize, value: u32 },
}
