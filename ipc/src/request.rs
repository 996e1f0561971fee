//! The fixed 0x20-byte IPC request record
//!
//! Layout (big-endian words):
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0x00 | command |
//! | 0x04 | result |
//! | 0x08 | fd, or the original command once re-tagged as a reply |
//! | 0x0C..0x20 | per-command arguments (five words) |
//!
//! Argument words per command:
//!
//! - Open: path, mode, uid, gid (upper half of the word)
//! - Read/Write: data, length
//! - Seek: offset, whence
//! - Ioctl: ioctl, input, input length, output, output length
//! - Ioctlv: ioctl, input count, in/out count, vector array

use crate::WireError;
use serde::{Deserialize, Serialize};
use zerocopy::byteorder::big_endian::{I32, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Size of an encoded request
pub const REQUEST_SIZE: usize = 0x20;

/// IPC command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Command {
    Open = 1,
    Close = 2,
    Read = 3,
    Write = 4,
    Seek = 5,
    Ioctl = 6,
    Ioctlv = 7,
    Reply = 8,
}

impl Command {
    /// Decodes a raw command word
    pub fn from_raw(raw: u32) -> Result<Self, WireError> {
        match raw {
            1 => Ok(Command::Open),
            2 => Ok(Command::Close),
            3 => Ok(Command::Read),
            4 => Ok(Command::Write),
            5 => Ok(Command::Seek),
            6 => Ok(Command::Ioctl),
            7 => Ok(Command::Ioctlv),
            8 => Ok(Command::Reply),
            other => Err(WireError::UnknownCommand(other)),
        }
    }

    /// Returns the raw command word
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Raw on-the-wire request record
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RawIpcRequest {
    pub command: U32,
    pub result: I32,
    pub handle: I32,
    pub args: [U32; 5],
}

impl RawIpcRequest {
    /// Reads a record from the start of `bytes`
    pub fn read(bytes: &[u8]) -> Result<Self, WireError> {
        let head = bytes.get(..REQUEST_SIZE).ok_or(WireError::Truncated {
            needed: REQUEST_SIZE,
            available: bytes.len(),
        })?;
        Self::read_from_bytes(head).map_err(|_| WireError::Truncated {
            needed: REQUEST_SIZE,
            available: bytes.len(),
        })
    }

    /// Re-tags the record as the reply to itself
    ///
    /// The argument words are left untouched so the caller can still find its
    /// buffers; the fd field now carries the command that was answered.
    pub fn retag_as_reply(&mut self, result: i32) {
        let original = self.command.get();
        self.command = U32::new(Command::Reply.as_u32());
        self.result = I32::new(result);
        self.handle = I32::new(original as i32);
    }

    /// Returns the record's 0x20 bytes
    pub fn to_bytes(&self) -> [u8; REQUEST_SIZE] {
        let mut out = [0u8; REQUEST_SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }

    fn arg(&self, index: usize) -> u32 {
        self.args[index].get()
    }
}

/// Per-command request arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestPayload {
    Open {
        path: u32,
        mode: u32,
        uid: u32,
        gid: u16,
    },
    Close,
    Read {
        data: u32,
        length: u32,
    },
    Write {
        data: u32,
        length: u32,
    },
    Seek {
        offset: i32,
        whence: u32,
    },
    Ioctl {
        ioctl: u32,
        input: u32,
        input_len: u32,
        output: u32,
        output_len: u32,
    },
    Ioctlv {
        ioctl: u32,
        input_count: u32,
        io_count: u32,
        vectors: u32,
    },
    /// A completed request; `IpcRequest::handle` holds the answered command
    Reply,
}

impl RequestPayload {
    /// Returns the command this payload belongs to
    pub fn command(&self) -> Command {
        match self {
            RequestPayload::Open { .. } => Command::Open,
            RequestPayload::Close => Command::Close,
            RequestPayload::Read { .. } => Command::Read,
            RequestPayload::Write { .. } => Command::Write,
            RequestPayload::Seek { .. } => Command::Seek,
            RequestPayload::Ioctl { .. } => Command::Ioctl,
            RequestPayload::Ioctlv { .. } => Command::Ioctlv,
            RequestPayload::Reply => Command::Reply,
        }
    }

    fn to_args(self) -> [u32; 5] {
        match self {
            RequestPayload::Open {
                path,
                mode,
                uid,
                gid,
            } => [path, mode, uid, (gid as u32) << 16, 0],
            RequestPayload::Close | RequestPayload::Reply => [0; 5],
            RequestPayload::Read { data, length } | RequestPayload::Write { data, length } => {
                [data, length, 0, 0, 0]
            }
            RequestPayload::Seek { offset, whence } => [offset as u32, whence, 0, 0, 0],
            RequestPayload::Ioctl {
                ioctl,
                input,
                input_len,
                output,
                output_len,
            } => [ioctl, input, input_len, output, output_len],
            RequestPayload::Ioctlv {
                ioctl,
                input_count,
                io_count,
                vectors,
            } => [ioctl, input_count, io_count, vectors, 0],
        }
    }
}

/// A decoded IPC request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcRequest {
    /// Result code; meaningful once replied
    pub result: i32,
    /// Resource-manager handle (fd field), or the answered command for replies
    pub handle: i32,
    pub payload: RequestPayload,
}

impl IpcRequest {
    /// Creates a fresh request addressed to `handle`
    pub fn new(handle: i32, payload: RequestPayload) -> Self {
        Self {
            result: 0,
            handle,
            payload,
        }
    }

    /// Returns the command word
    pub fn command(&self) -> Command {
        self.payload.command()
    }

    /// Converts to the raw record
    pub fn to_raw(&self) -> RawIpcRequest {
        let args = self.payload.to_args();
        RawIpcRequest {
            command: U32::new(self.command().as_u32()),
            result: I32::new(self.result),
            handle: I32::new(self.handle),
            args: args.map(U32::new),
        }
    }

    /// Encodes the request into its 0x20-byte form
    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let mut out = [0u8; REQUEST_SIZE];
        out.copy_from_slice(self.to_raw().as_bytes());
        out
    }

    /// Decodes a request from a raw record
    pub fn from_raw(raw: &RawIpcRequest) -> Result<Self, WireError> {
        let command = Command::from_raw(raw.command.get())?;
        let payload = match command {
            Command::Open => RequestPayload::Open {
                path: raw.arg(0),
                mode: raw.arg(1),
                uid: raw.arg(2),
                gid: (raw.arg(3) >> 16) as u16,
            },
            Command::Close => RequestPayload::Close,
            Command::Read => RequestPayload::Read {
                data: raw.arg(0),
                length: raw.arg(1),
            },
            Command::Write => RequestPayload::Write {
                data: raw.arg(0),
                length: raw.arg(1),
            },
            Command::Seek => RequestPayload::Seek {
                offset: raw.arg(0) as i32,
                whence: raw.arg(1),
            },
            Command::Ioctl => RequestPayload::Ioctl {
                ioctl: raw.arg(0),
                input: raw.arg(1),
                input_len: raw.arg(2),
                output: raw.arg(3),
                output_len: raw.arg(4),
            },
            Command::Ioctlv => RequestPayload::Ioctlv {
                ioctl: raw.arg(0),
                input_count: raw.arg(1),
                io_count: raw.arg(2),
                vectors: raw.arg(3),
            },
            Command::Reply => RequestPayload::Reply,
        };
        Ok(Self {
            result: raw.result.get(),
            handle: raw.handle.get(),
            payload,
        })
    }

    /// Decodes a request from the start of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Self::from_raw(&RawIpcRequest::read(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_record_is_0x20_bytes() {
        assert_eq!(core::mem::size_of::<RawIpcRequest>(), REQUEST_SIZE);
    }

    #[test]
    fn test_open_field_offsets() {
        let request = IpcRequest::new(
            0,
            RequestPayload::Open {
                path: 0x1000_0040,
                mode: 3,
                uid: 0x1000,
                gid: 0x0001,
            },
        );
        let bytes = request.encode();

        assert_eq!(&bytes[0x00..0x04], &[0, 0, 0, 1]);
        assert_eq!(&bytes[0x0C..0x10], &[0x10, 0x00, 0x00, 0x40]);
        assert_eq!(&bytes[0x10..0x14], &[0, 0, 0, 3]);
        assert_eq!(&bytes[0x14..0x18], &[0, 0, 0x10, 0]);
        assert_eq!(&bytes[0x18..0x1A], &[0, 1]);
        assert_eq!(IpcRequest::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn test_ioctl_uses_every_argument_word() {
        let request = IpcRequest::new(
            5,
            RequestPayload::Ioctl {
                ioctl: 0x21,
                input: 0x100,
                input_len: 0x20,
                output: 0x200,
                output_len: 0x40,
            },
        );
        let bytes = request.encode();

        assert_eq!(&bytes[0x08..0x0C], &[0, 0, 0, 5]);
        assert_eq!(&bytes[0x1C..0x20], &[0, 0, 0, 0x40]);
    }

    #[test]
    fn test_negative_seek_offset_survives_encoding() {
        let request = IpcRequest::new(
            2,
            RequestPayload::Seek {
                offset: -16,
                whence: 1,
            },
        );
        let decoded = IpcRequest::decode(&request.encode()).unwrap();
        assert_eq!(decoded.payload, RequestPayload::Seek { offset: -16, whence: 1 });
    }

    #[test]
    fn test_retag_as_reply_keeps_arguments() {
        let request = IpcRequest::new(
            4,
            RequestPayload::Write {
                data: 0x1000_2000,
                length: 64,
            },
        );
        let mut raw = request.to_raw();
        raw.retag_as_reply(64);

        assert_eq!(raw.command.get(), Command::Reply.as_u32());
        assert_eq!(raw.result.get(), 64);
        assert_eq!(raw.handle.get(), Command::Write.as_u32() as i32);
        assert_eq!(raw.args[0].get(), 0x1000_2000);
        assert_eq!(raw.args[1].get(), 64);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut bytes = [0u8; REQUEST_SIZE];
        bytes[3] = 0x42;
        assert_eq!(IpcRequest::decode(&bytes), Err(WireError::UnknownCommand(0x42)));
    }

    #[test]
    fn test_truncated_record_rejected() {
        assert_eq!(
            IpcRequest::decode(&[0u8; 8]),
            Err(WireError::Truncated {
                needed: REQUEST_SIZE,
                available: 8
            })
        );
    }
}
