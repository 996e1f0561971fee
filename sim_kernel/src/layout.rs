//! Kernel memory map
//!
//! Fixed addresses of the kernel-owned regions. All of them sit in cached
//! RAM above the area handed to modules.

/// Kernel message slots, 0x34 bytes each
pub const MESSAGE_POOL_BASE: u32 = 0x13A0_0000;

/// Second-level page tables, 0x400 bytes each
pub const COARSE_POOL_BASE: u32 = 0x13B0_0000;

/// Kernel-assigned thread stacks
pub const STACK_POOL_BASE: u32 = 0x13C0_0000;

/// Return address installed in every new thread's `lr`
pub const THREAD_EXIT_TRAMPOLINE: u32 = 0xFFFF_0F00;

/// Virtual address of the hardware-register alias page
pub const HARDWARE_REGISTERS: u32 = 0x0D00_0000;

/// Size of a first-level section
pub const SECTION_SIZE: u32 = 0x10_0000;

/// Size of a course page
pub const PAGE_SIZE: u32 = 0x1000;
