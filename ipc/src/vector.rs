//! Ioctlv vector entries

use crate::WireError;
use serde::{Deserialize, Serialize};
use zerocopy::byteorder::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Size of one encoded vector entry
pub const IO_VECTOR_SIZE: usize = 8;

/// Longest device path an Open may carry, terminator included
pub const MAX_PATH_LEN: usize = 0x40;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct RawIoVector {
    data: U32,
    length: U32,
}

/// One buffer of an Ioctlv request
///
/// The first `input_count` entries of a vector array are inputs, the
/// following `io_count` entries are outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoVector {
    pub data: u32,
    pub length: u32,
}

impl IoVector {
    pub fn new(data: u32, length: u32) -> Self {
        Self { data, length }
    }

    pub fn encode(&self) -> [u8; IO_VECTOR_SIZE] {
        let raw = RawIoVector {
            data: U32::new(self.data),
            length: U32::new(self.length),
        };
        let mut out = [0u8; IO_VECTOR_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let truncated = || WireError::Truncated {
            needed: IO_VECTOR_SIZE,
            available: bytes.len(),
        };
        let head = bytes.get(..IO_VECTOR_SIZE).ok_or_else(truncated)?;
        let raw = RawIoVector::read_from_bytes(head).map_err(|_| truncated())?;
        Ok(Self {
            data: raw.data.get(),
            length: raw.length.get(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_layout() {
        let bytes = IoVector::new(0x1000_0100, 0x20).encode();
        assert_eq!(bytes, [0x10, 0, 0x01, 0, 0, 0, 0, 0x20]);
        assert_eq!(IoVector::decode(&bytes).unwrap().length, 0x20);
    }

    #[test]
    fn test_short_vector_rejected() {
        assert!(matches!(
            IoVector::decode(&[0u8; 4]),
            Err(WireError::Truncated { needed: 8, available: 4 })
        ));
    }
}
