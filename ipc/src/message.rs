//! The 0x34-byte kernel IPC message
//!
//! A message is the request record followed by the kernel's delivery
//! bookkeeping:
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0x00..0x20 | [`IpcRequest`] |
//! | 0x20 | callback queue, biased by one (0 = synchronous call) |
//! | 0x24 | caller data (the caller's own record, chained on reply) |
//! | 0x28 | thread holding the slot (0 = none) |
//! | 0x2C | process allowed to reply |
//! | 0x30 | in-queue flag |

use crate::request::{IpcRequest, RawIpcRequest, REQUEST_SIZE};
use crate::WireError;
use core_types::{ProcessId, QueueId, ThreadId};
use zerocopy::byteorder::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Size of an encoded message
pub const MESSAGE_SIZE: usize = 0x34;

/// Raw on-the-wire message record
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RawIpcMessage {
    pub request: RawIpcRequest,
    pub callback: U32,
    pub caller_data: U32,
    pub used_by_thread: U32,
    pub used_by_process: U32,
    pub in_queue: U32,
}

/// A decoded kernel IPC message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcMessage {
    pub request: IpcRequest,
    /// Queue that receives the reply of an asynchronous call
    pub callback: Option<QueueId>,
    /// Caller-side record chained back on reply
    pub caller_data: u32,
    pub used_by_thread: Option<ThreadId>,
    /// Process that may answer this message
    pub used_by_process: ProcessId,
    pub in_queue: bool,
}

impl IpcMessage {
    /// Returns true if the call completes through a callback queue
    pub fn is_async(&self) -> bool {
        self.callback.is_some()
    }

    /// Encodes the message into its 0x34-byte form
    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let raw = RawIpcMessage {
            request: self.request.to_raw(),
            callback: U32::new(self.callback.map_or(0, |queue| queue.as_u32() + 1)),
            caller_data: U32::new(self.caller_data),
            used_by_thread: U32::new(self.used_by_thread.map_or(0, ThreadId::as_u32)),
            used_by_process: U32::new(self.used_by_process.as_u32()),
            in_queue: U32::new(self.in_queue as u32),
        };
        let mut out = [0u8; MESSAGE_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    /// Decodes a message from the start of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let truncated = WireError::Truncated {
            needed: MESSAGE_SIZE,
            available: bytes.len(),
        };
        let head = bytes.get(..MESSAGE_SIZE).ok_or(truncated.clone())?;
        let raw = RawIpcMessage::read_from_bytes(head).map_err(|_| truncated)?;

        let callback = match raw.callback.get() {
            0 => None,
            biased => Some(QueueId::from_raw(biased - 1)),
        };
        let used_by_thread = match raw.used_by_thread.get() {
            0 => None,
            raw_thread => Some(
                ThreadId::from_raw(raw_thread).ok_or(WireError::BadField {
                    offset: REQUEST_SIZE + 0x08,
                    value: raw_thread,
                })?,
            ),
        };
        let process = raw.used_by_process.get();
        let used_by_process = ProcessId::new(process).ok_or(WireError::BadField {
            offset: REQUEST_SIZE + 0x0C,
            value: process,
        })?;

        Ok(Self {
            request: IpcRequest::from_raw(&raw.request)?,
            callback,
            caller_data: raw.caller_data.get(),
            used_by_thread,
            used_by_process,
            in_queue: raw.in_queue.get() != 0,
        })
    }
}
