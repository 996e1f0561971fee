//! Simulated physical memory
//!
//! A sparse, page-granular byte store covering the whole 32-bit address
//! space. Untouched memory reads as zero. Words are big-endian, as on the
//! target.

use crate::layout::PAGE_SIZE;
use std::collections::HashMap;

/// Sparse physical memory
#[derive(Debug, Clone, Default)]
pub struct PhysicalMemory {
    pages: HashMap<u32, Box<[u8]>>,
}

impl PhysicalMemory {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
        }
    }

    /// Reads `len` bytes starting at `addr`
    pub fn read_bytes(&self, addr: u32, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut cursor = addr;
        let mut remaining = len;
        while remaining > 0 {
            let offset = (cursor % PAGE_SIZE) as usize;
            let chunk = remaining.min(PAGE_SIZE as usize - offset);
            match self.pages.get(&(cursor / PAGE_SIZE)) {
                Some(page) => out.extend_from_slice(&page[offset..offset + chunk]),
                None => out.resize(out.len() + chunk, 0),
            }
            remaining -= chunk;
            cursor = cursor.wrapping_add(chunk as u32);
        }
        out
    }

    /// Writes `bytes` starting at `addr`
    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) {
        let mut cursor = addr;
        let mut rest = bytes;
        while !rest.is_empty() {
            let offset = (cursor % PAGE_SIZE) as usize;
            let chunk = rest.len().min(PAGE_SIZE as usize - offset);
            let page = self
                .pages
                .entry(cursor / PAGE_SIZE)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            page[offset..offset + chunk].copy_from_slice(&rest[..chunk]);
            rest = &rest[chunk..];
            cursor = cursor.wrapping_add(chunk as u32);
        }
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        let bytes = self.read_bytes(addr, 4);
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) {
        self.write_bytes(addr, &value.to_be_bytes());
    }

    /// Returns the length of the NUL-terminated string at `addr`
    ///
    /// Scans at most `max` bytes; `None` if no terminator was found.
    pub fn c_string_len(&self, addr: u32, max: usize) -> Option<usize> {
        self.read_bytes(addr, max).iter().position(|&b| b == 0)
    }

    /// Reads the NUL-terminated string at `addr` (lossy UTF-8)
    pub fn read_c_string(&self, addr: u32, max: usize) -> Option<String> {
        let len = self.c_string_len(addr, max)?;
        Some(String::from_utf8_lossy(&self.read_bytes(addr, len)).into_owned())
    }

    /// Number of pages that have been written
    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }
}
