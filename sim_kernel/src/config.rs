//! Kernel configuration
//!
//! Table sizes and the external processor's buffer windows. Every field has
//! a default matching the production kernel; `from_json` overrides any
//! subset of them.

use serde::{Deserialize, Serialize};

/// A half-open physical address window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferWindow {
    pub start: u32,
    pub end: u32,
}

impl BufferWindow {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Returns true if `[ptr, ptr + len)` lies entirely inside the window
    pub fn contains(&self, ptr: u32, len: u32) -> bool {
        let end = ptr as u64 + len as u64;
        ptr >= self.start && end <= self.end as u64
    }
}

/// Kernel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Thread table slots, including the never-allocated slot 0
    pub max_threads: usize,
    /// Highest thread priority
    pub max_priority: u8,
    /// Stack size used when a thread is created with size 0
    pub default_stack_size: u32,
    /// Shared message slots beyond the one-per-thread slots
    pub spare_message_slots: usize,
    pub max_message_queues: usize,
    pub max_resource_managers: usize,
    pub fds_per_process: usize,
    pub max_timers: usize,
    pub max_heaps: usize,
    /// Replies that may wait for the external processor
    pub relay_ring_capacity: usize,
    /// Second-level tables available for course-page mappings
    pub coarse_table_pool: usize,
    /// Fast RAM window the external processor may name
    pub fast_ram: BufferWindow,
    /// Cached RAM window the external processor may name
    pub cached_ram: BufferWindow,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_threads: 100,
            max_priority: 127,
            default_stack_size: 0x1000,
            spare_message_slots: 32,
            max_message_queues: 64,
            max_resource_managers: 32,
            fds_per_process: 24,
            max_timers: 32,
            max_heaps: 16,
            relay_ring_capacity: 16,
            coarse_table_pool: 64,
            fast_ram: BufferWindow::new(0x0000_0000, 0x0180_0000),
            cached_ram: BufferWindow::new(0x1000_0000, 0x1400_0000),
        }
    }
}

impl KernelConfig {
    /// Parses a configuration, filling unspecified fields with defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Returns true if the external processor may name `[ptr, ptr + len)`
    pub fn external_window_contains(&self, ptr: u32, len: u32) -> bool {
        self.fast_ram.contains(ptr, len) || self.cached_ram.contains(ptr, len)
    }
}
