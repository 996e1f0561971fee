//! Test utilities
//!
//! [`TestSystem`] boots a kernel with a small memory map so unit and
//! scenario tests can start from a realistic system instead of building
//! page tables by hand.
//!
//! # Memory map
//!
//! | Range                      | Domain | Access                      |
//! |----------------------------|--------|-----------------------------|
//! | `0x0000_0000..0x0180_0000` | 1      | fast RAM, user read/write   |
//! | `0x1000_0000 + p * 1 MiB`  | p + 1  | private to process `p`      |
//! | `0x1200_0000`              | 1      | user read-only              |
//! | `0x1300_0000`              | 1      | four course pages           |
//! | `0x1380_0000`              | 0      | kernel scratch              |
//! | kernel pools               | 0      | privileged only             |
//! | thread stacks              | 1      | user read/write             |
//!
//! Process `p` is a client of domain 1 and domain `p + 1`; the kernel is a
//! manager of everything. The external processor (pid 15) sees domain 1 only.
//!
//! The kernel main thread runs at priority 1 so any thread a test starts
//! takes the CPU from it, and falls back to it once that thread blocks.

use crate::layout::{
    COARSE_POOL_BASE, MESSAGE_POOL_BASE, PAGE_SIZE, SECTION_SIZE, STACK_POOL_BASE,
};
use crate::mmu::{MapMode, MemorySection};
use crate::relay::SimMailbox;
use crate::thread::SavedContext;
use crate::{KernelConfig, SimulatedKernel};
use core_types::{
    AccessPermission, Domain, DomainAccess, DomainAccessControl, ProcessId, QueueId, ThreadId,
    MAX_PROCESSES,
};
use kernel_api::{KernelApi, ThreadParams};

/// Start of fast RAM handed out by [`TestSystem::alloc_shared`]
pub const SHARED_BASE: u32 = 0x0001_0000;

/// End of fast RAM
pub const SHARED_END: u32 = 0x0180_0000;

/// Base of the per-process private regions
pub const PRIVATE_BASE: u32 = 0x1000_0000;

/// A user read-only page in domain 1
pub const READ_ONLY_BASE: u32 = 0x1200_0000;

/// Course-page mapped RAM in domain 1
pub const COURSE_BASE: u32 = 0x1300_0000;

/// Kernel-only scratch memory
pub const KERNEL_SCRATCH_BASE: u32 = 0x1380_0000;

/// Priority the kernel main thread idles at
pub const MAIN_PRIORITY: u8 = 1;

const SHARED_DOMAIN: u32 = 1;

fn domain(raw: u32) -> Domain {
    Domain::new(raw).expect("domain in range")
}

fn private_domain(process: ProcessId) -> Domain {
    domain(process.as_u32() + 1)
}

fn align(value: u32) -> u32 {
    (value + 31) & !31
}

/// A booted kernel plus bump allocators over its memory map
pub struct TestSystem {
    pub kernel: SimulatedKernel,
    /// The kernel main thread
    pub main: ThreadId,
    /// External side of the mailbox
    pub mailbox: SimMailbox,
    next_shared: u32,
    next_kernel: u32,
    next_private: [u32; MAX_PROCESSES],
}

impl TestSystem {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        let mailbox = SimMailbox::new();
        let mut kernel = SimulatedKernel::with_mailbox(config, Box::new(mailbox.clone()));
        map_boot_memory(&mut kernel);

        let main = kernel.thread_id();
        kernel
            .set_thread_priority(main, MAIN_PRIORITY)
            .expect("main thread may lower itself");

        let mut next_private = [0; MAX_PROCESSES];
        for (pid, next) in next_private.iter_mut().enumerate() {
            *next = PRIVATE_BASE + pid as u32 * SECTION_SIZE;
        }
        Self {
            kernel,
            main,
            mailbox,
            next_shared: SHARED_BASE,
            next_kernel: KERNEL_SCRATCH_BASE,
            next_private,
        }
    }

    pub fn pid(&self, raw: u32) -> ProcessId {
        ProcessId::new(raw).expect("process id in range")
    }

    /// Creates and starts a thread in process `pid`
    ///
    /// The thread runs straight away unless the running thread outranks it.
    pub fn spawn(&mut self, pid: u32, priority: u8) -> ThreadId {
        self.focus(self.main);
        let process = self.pid(pid);
        let thread = self
            .kernel
            .create_thread_for_process(process, ThreadParams::new(0x0002_0000, 0, priority))
            .expect("create thread");
        self.kernel.start_thread(thread).expect("start thread");
        thread
    }

    /// Makes `thread` the running thread
    pub fn focus(&mut self, thread: ThreadId) {
        if self.kernel.scheduler().current() != Some(thread) {
            self.kernel.run_thread(thread).expect("thread is ready");
        }
    }

    /// Reserves `len` bytes in the private region of `pid`
    pub fn alloc(&mut self, pid: u32, len: usize) -> u32 {
        let next = &mut self.next_private[pid as usize];
        let addr = *next;
        *next = align(addr + len as u32);
        assert!(*next <= PRIVATE_BASE + (pid + 1) * SECTION_SIZE, "private region exhausted");
        addr
    }

    /// Reserves `len` bytes of kernel-only memory
    pub fn alloc_kernel(&mut self, len: usize) -> u32 {
        let addr = self.next_kernel;
        self.next_kernel = align(addr + len as u32);
        addr
    }

    /// Reserves `len` bytes of fast RAM every process can use
    pub fn alloc_shared(&mut self, len: usize) -> u32 {
        let addr = self.next_shared;
        self.next_shared = align(addr + len as u32);
        assert!(self.next_shared <= SHARED_END, "fast RAM exhausted");
        addr
    }

    /// Writes a NUL-terminated string into the private region of `pid`
    pub fn write_cstr(&mut self, pid: u32, s: &str) -> u32 {
        let addr = self.alloc(pid, s.len() + 1);
        self.write_cstr_at(addr, s);
        addr
    }

    /// Writes a NUL-terminated string into fast RAM
    pub fn write_cstr_shared(&mut self, s: &str) -> u32 {
        let addr = self.alloc_shared(s.len() + 1);
        self.write_cstr_at(addr, s);
        addr
    }

    fn write_cstr_at(&mut self, addr: u32, s: &str) {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.kernel.memory_mut().write_bytes(addr, &bytes);
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        self.kernel.memory().read_u32(addr)
    }

    /// Address inside the user read-only page
    pub fn read_only_address(&self) -> u32 {
        READ_ONLY_BASE
    }

    /// Saved registers of `thread`
    pub fn context(&self, thread: ThreadId) -> SavedContext {
        self.kernel
            .thread_context(thread)
            .copied()
            .expect("thread exists")
    }

    /// Starts a resource manager in `pid` serving `path`
    ///
    /// Returns its thread, its queue and the word its receive writes to.
    /// The thread runs at priority 100 and is left blocked in receive.
    pub fn serve(&mut self, pid: u32, path: &str, capacity: u32) -> (ThreadId, QueueId, u32) {
        let thread = self.spawn(pid, 100);
        self.focus(thread);
        let buffer = self.alloc(pid, capacity as usize * 4);
        let out = self.alloc(pid, 4);
        let name = self.write_cstr(pid, path);
        let queue = self
            .kernel
            .create_message_queue(buffer, capacity)
            .expect("create queue");
        self.kernel
            .register_resource_manager(name, queue)
            .expect("register resource manager");
        let receive = self
            .kernel
            .receive_message(queue, out, 0)
            .expect("receive");
        assert!(receive.is_suspended(), "queue starts empty");
        (thread, queue, out)
    }
}

impl Default for TestSystem {
    fn default() -> Self {
        Self::new()
    }
}

fn map_boot_memory(kernel: &mut SimulatedKernel) {
    let shared = domain(SHARED_DOMAIN);
    let sections = [
        MemorySection::identity(0, SHARED_END, shared, AccessPermission::ReadWrite),
        MemorySection::identity(READ_ONLY_BASE, SECTION_SIZE, shared, AccessPermission::ReadOnly),
        MemorySection::identity(
            KERNEL_SCRATCH_BASE,
            SECTION_SIZE,
            Domain::KERNEL,
            AccessPermission::PrivilegedOnly,
        ),
        MemorySection::identity(
            MESSAGE_POOL_BASE,
            SECTION_SIZE,
            Domain::KERNEL,
            AccessPermission::PrivilegedOnly,
        ),
        MemorySection::identity(
            COARSE_POOL_BASE,
            SECTION_SIZE,
            Domain::KERNEL,
            AccessPermission::PrivilegedOnly,
        ),
        MemorySection::identity(STACK_POOL_BASE, SECTION_SIZE, shared, AccessPermission::ReadWrite),
    ];
    for section in sections {
        kernel
            .map_memory(section, MapMode::Fresh)
            .expect("boot section");
    }
    kernel
        .map_memory(
            MemorySection::identity(COURSE_BASE, 4 * PAGE_SIZE, shared, AccessPermission::ReadWrite),
            MapMode::Fresh,
        )
        .expect("boot course pages");

    for raw in 1..MAX_PROCESSES as u32 {
        let Some(process) = ProcessId::new(raw) else {
            continue;
        };
        let mut dacr = DomainAccessControl::NONE.with(shared, DomainAccess::Client);
        if process != ProcessId::EXTERNAL {
            dacr = dacr.with(private_domain(process), DomainAccess::Client);
            kernel
                .map_memory(
                    MemorySection::identity(
                        PRIVATE_BASE + raw * SECTION_SIZE,
                        SECTION_SIZE,
                        private_domain(process),
                        AccessPermission::ReadWrite,
                    ),
                    MapMode::Fresh,
                )
                .expect("private region");
        }
        kernel.set_domain_access(process, dacr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::AccessKind;

    #[test]
    fn test_boot_map_separates_processes() {
        let mut sys = TestSystem::new();
        let a = sys.alloc(1, 16);
        let b = sys.alloc(2, 16);
        let shared = sys.alloc_shared(16);
        let (p1, p2) = (sys.pid(1), sys.pid(2));
        let mmu = sys.kernel.mmu_mut();

        assert!(mmu.check_memory_pointer(a, 16, AccessKind::Write, p1, p1).is_ok());
        assert!(mmu.check_memory_pointer(b, 16, AccessKind::Read, p1, p1).is_err());
        assert!(mmu.check_memory_pointer(shared, 16, AccessKind::Write, p1, p2).is_ok());
        assert!(mmu
            .check_memory_pointer(READ_ONLY_BASE, 4, AccessKind::Write, p1, p1)
            .is_err());
        assert!(mmu
            .check_memory_pointer(COURSE_BASE + PAGE_SIZE, 4, AccessKind::Write, p1, p1)
            .is_ok());
        assert!(mmu
            .check_memory_pointer(KERNEL_SCRATCH_BASE, 4, AccessKind::Read, p1, p1)
            .is_err());
    }

    #[test]
    fn test_spawned_thread_outranks_main() {
        let mut sys = TestSystem::new();
        let thread = sys.spawn(3, 10);
        assert_eq!(sys.kernel.thread_id(), thread);
        sys.focus(sys.main);
        assert_eq!(sys.kernel.thread_id(), sys.main);
        // Focusing the running thread is a no-op
        sys.focus(sys.main);
        assert_eq!(sys.kernel.thread_priority(sys.main).unwrap(), MAIN_PRIORITY);
    }
}
