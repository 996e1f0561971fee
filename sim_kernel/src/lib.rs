//! # Simulated Kernel
//!
//! An in-process model of a single-core microkernel: threads, message
//! queues, IPC to resource managers, a two-level MMU with domain-based
//! protection, and a mailbox relay for requests from an external processor.
//!
//! ## Purpose
//!
//! The simulation lets the whole kernel run under `cargo test`:
//! - Deterministic (simulated time, one core, no host threads)
//! - Inspectable (threads, queues, page tables and audit logs are public)
//! - Faithful at the boundary (every call is checked the way the real
//!   kernel checks it, down to the error code)
//!
//! ## Execution model
//!
//! Every [`KernelApi`] method runs on behalf of the thread that is currently
//! Running. A call that would block parks that thread, switches to the next
//! one and returns [`kernel_api::Blocking::Suspended`]; the parked call
//! completes later when another call wakes it, with its result written into
//! the parked thread's saved `r0`. Tests drive the system by choosing the
//! running thread and issuing calls as it.
//!
//! User threads enter through [`SimulatedKernel::syscall`], which decodes
//! arguments from saved registers and the user stack.

pub mod audit;
pub mod config;
pub mod credentials;
pub mod events;
pub mod heap;
pub mod interrupts;
pub mod layout;
pub mod memory;
pub mod message_pool;
pub mod message_queue;
pub mod mmu;
pub mod relay;
pub mod resource_manager;
pub mod scheduler;
pub mod syscall_gate;
pub mod test_utils;
pub mod thread;
pub mod thread_queue;
pub mod timer;
pub mod timers;
pub mod transport;

pub use audit::{AuditLog, KernelEvent};
pub use config::{BufferWindow, KernelConfig};
pub use relay::SimMailbox;
pub use syscall_gate::{SyscallEvent, SyscallOutcome};

use crate::credentials::Credentials;
use crate::events::{EventHandler, MAX_DEVICES};
use crate::heap::{Heap, HEAP_GRANULE};
use crate::interrupts::SimInterruptController;
use crate::memory::PhysicalMemory;
use crate::message_pool::MessagePool;
use crate::message_queue::MessageQueue;
use crate::mmu::{FirstLevelEntry, MapMode, MemorySection, Mmu};
use crate::relay::Relay;
use crate::resource_manager::ResourceRegistry;
use crate::scheduler::Scheduler;
use crate::thread::{BlockedOp, SavedContext, Thread, ThreadState, WaitSite};
use crate::timer::SimTimerDevice;
use crate::timers::Timer;
use crate::transport::{FdTable, InFlight, Origin};
use core_types::{
    DomainAccessControl, HeapId, ProcessId, QueueId, ResourceManagerId, ThreadId, TimerId,
    MAX_PROCESSES,
};
use hal::{CriticalSection, MailboxHal, SharedInterrupts};
use kernel_api::{
    Blocking, Completion, Instant, IpcCall, KernelApi, KernelError, ThreadParams,
};
use log::error;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Simulated kernel state
///
/// Unlike a real kernel, this state is directly accessible for testing.
pub struct SimulatedKernel {
    pub(crate) config: KernelConfig,
    pub(crate) irq: SharedInterrupts,
    pub(crate) memory: PhysicalMemory,
    pub(crate) mmu: Mmu,
    pub(crate) scheduler: Scheduler,
    pub(crate) credentials: Vec<Credentials>,
    pub(crate) queues: Vec<Option<MessageQueue>>,
    pub(crate) registry: ResourceRegistry,
    pub(crate) pool: MessagePool,
    /// One descriptor table per process
    pub(crate) fds: Vec<FdTable>,
    /// Dispatched requests keyed by message slot address
    pub(crate) in_flight: BTreeMap<u32, InFlight>,
    pub(crate) relay: Relay,
    pub(crate) timers: Vec<Option<Timer>>,
    pub(crate) clock: SimTimerDevice,
    pub(crate) events: Vec<Option<EventHandler>>,
    pub(crate) heaps: Vec<Option<Heap>>,
    pub(crate) syscall_audit: AuditLog<SyscallEvent>,
    pub(crate) kernel_events: AuditLog<KernelEvent>,
}

/// A broken structural invariant found by [`SimulatedKernel::check_invariants`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("{count} threads are running")]
    SeveralRunning { count: usize },

    #[error("current thread {thread} is {state:?}")]
    CurrentNotRunning { thread: ThreadId, state: ThreadState },

    #[error("{thread} is {state:?} but not linked at {site:?}")]
    NotLinked {
        thread: ThreadId,
        state: ThreadState,
        site: WaitSite,
    },

    #[error("{thread} is linked into {count} queues")]
    LinkedTwice { thread: ThreadId, count: usize },

    #[error("{queue} holds {len} messages in {capacity} slots")]
    QueueOverflow {
        queue: QueueId,
        len: usize,
        capacity: usize,
    },

    #[error("{loans} message slots on loan for {requests} requests")]
    SlotLeak { loans: usize, requests: usize },

    #[error("request {message:#010x} is neither queued, parked nor delivered")]
    LostRequest { message: u32 },
}

impl SimulatedKernel {
    /// Boots a kernel with its own mailbox; the main thread is Running
    pub fn new(config: KernelConfig) -> Self {
        Self::with_mailbox(config, Box::new(SimMailbox::new()))
    }

    /// Boots a kernel wired to `mailbox`
    pub fn with_mailbox(config: KernelConfig, mailbox: Box<dyn MailboxHal>) -> Self {
        let irq: SharedInterrupts = Arc::new(SimInterruptController::new());
        let mut kernel = Self {
            irq,
            memory: PhysicalMemory::new(),
            mmu: Mmu::new(config.coarse_table_pool),
            scheduler: Scheduler::new(config.max_threads),
            credentials: vec![Credentials::default(); MAX_PROCESSES],
            queues: (0..config.max_message_queues).map(|_| None).collect(),
            registry: ResourceRegistry::new(config.max_resource_managers),
            pool: MessagePool::new(config.max_threads, config.spare_message_slots),
            fds: (0..MAX_PROCESSES)
                .map(|_| FdTable::new(config.fds_per_process))
                .collect(),
            in_flight: BTreeMap::new(),
            relay: Relay::new(mailbox, config.relay_ring_capacity),
            timers: vec![None; config.max_timers],
            clock: SimTimerDevice::new(),
            events: vec![None; MAX_DEVICES as usize],
            heaps: (0..config.max_heaps).map(|_| None).collect(),
            syscall_audit: AuditLog::new(),
            kernel_events: AuditLog::new(),
            config,
        };
        if let Err(e) = kernel.boot_main_thread() {
            error!("kernel main thread failed to boot: {}", e);
        }
        kernel
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.scheduler.thread(id)
    }

    pub fn thread_context(&self, id: ThreadId) -> Option<&SavedContext> {
        self.scheduler.thread(id).map(|t| &t.context)
    }

    /// Saved registers, for tests that stage a syscall
    pub fn thread_context_mut(&mut self, id: ThreadId) -> Option<&mut SavedContext> {
        self.scheduler.thread_mut(id).map(|t| &mut t.context)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn queue(&self, queue: QueueId) -> Option<&MessageQueue> {
        self.queues.get(queue.index()).and_then(Option::as_ref)
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut PhysicalMemory {
        &mut self.memory
    }

    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    pub fn mmu_mut(&mut self) -> &mut Mmu {
        &mut self.mmu
    }

    pub fn message_pool(&self) -> &MessagePool {
        &self.pool
    }

    pub fn kernel_events(&self) -> &AuditLog<KernelEvent> {
        &self.kernel_events
    }

    pub fn syscall_audit(&self) -> &AuditLog<SyscallEvent> {
        &self.syscall_audit
    }

    /// Installs a boot-time mapping
    pub fn map_memory(&mut self, section: MemorySection, mode: MapMode) -> Result<(), KernelError> {
        let cs = CriticalSection::enter(&self.irq);
        self.mmu.map_memory(&cs, section, mode)
    }

    pub fn set_domain_access(&mut self, process: ProcessId, dacr: DomainAccessControl) {
        let cs = CriticalSection::enter(&self.irq);
        self.mmu.set_domain_access(&cs, process, dacr);
    }

    pub fn set_hardware_view(&mut self, process: ProcessId, view: Option<FirstLevelEntry>) {
        let cs = CriticalSection::enter(&self.irq);
        self.mmu.set_hardware_view(&cs, process, view);
    }

    /// Checks the structural invariants that must hold between calls
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let running = self
            .scheduler
            .threads()
            .filter(|t| t.state == ThreadState::Running)
            .count();
        if running > 1 {
            return Err(InvariantViolation::SeveralRunning { count: running });
        }
        if let Some(thread) = self.scheduler.current().and_then(|id| self.scheduler.thread(id)) {
            if thread.state != ThreadState::Running {
                return Err(InvariantViolation::CurrentNotRunning {
                    thread: thread.id,
                    state: thread.state,
                });
            }
        }

        let mut links = vec![0usize; self.config.max_threads.max(2)];
        let mut count = |ids: &mut dyn Iterator<Item = ThreadId>| {
            for id in ids {
                if let Some(slot) = links.get_mut(id.index()) {
                    *slot += 1;
                }
            }
        };
        count(&mut self.scheduler.ready_queue().iter());
        count(&mut self.relay.backlog().iter());
        for queue in self.queues.iter().flatten() {
            count(&mut queue.senders().iter());
            count(&mut queue.receivers().iter());
        }
        for thread in self.scheduler.threads() {
            count(&mut thread.joiners.iter());
        }
        if let Some((index, &count)) = links.iter().enumerate().find(|(_, &c)| c > 1) {
            return Err(InvariantViolation::LinkedTwice {
                thread: ThreadId::from_index(index),
                count,
            });
        }

        for thread in self.scheduler.threads() {
            let linked = match (thread.state, thread.wait) {
                (ThreadState::Ready, _) => self.scheduler.ready_queue().contains(thread.id),
                (ThreadState::Waiting, WaitSite::Receivers(queue)) => self
                    .queue(queue)
                    .is_some_and(|q| q.receivers().contains(thread.id)),
                (ThreadState::Waiting, WaitSite::Senders(queue)) => self
                    .queue(queue)
                    .is_some_and(|q| q.senders().contains(thread.id)),
                (ThreadState::Waiting, WaitSite::Joiners(target)) => self
                    .scheduler
                    .thread(target)
                    .is_some_and(|t| t.joiners.contains(thread.id)),
                (ThreadState::Waiting, WaitSite::RelayBacklog) => {
                    self.relay.backlog().contains(thread.id)
                }
                (ThreadState::Waiting, WaitSite::Reply(message)) => {
                    self.in_flight.get(&message).is_some_and(|request| {
                        !request.orphaned
                            && request.origin == Origin::Sync { thread: thread.id }
                    })
                }
                (ThreadState::Waiting, _) => false,
                _ => true,
            };
            if !linked {
                return Err(InvariantViolation::NotLinked {
                    thread: thread.id,
                    state: thread.state,
                    site: thread.wait,
                });
            }
        }

        for (index, queue) in self.queues.iter().enumerate() {
            if let Some(q) = queue {
                if q.len() > q.capacity {
                    return Err(InvariantViolation::QueueOverflow {
                        queue: QueueId::from_index(index),
                        len: q.len(),
                        capacity: q.capacity,
                    });
                }
            }
        }

        for (&message, request) in &self.in_flight {
            let queued = self
                .queue(request.queue)
                .is_some_and(|q| q.messages().any(|m| m == message));
            let parked = self.scheduler.threads().any(|t| {
                t.wait == WaitSite::Senders(request.queue)
                    && matches!(t.blocked, Some(BlockedOp::Send { message: m, .. }) if m == message)
            });
            let stalled = self.relay.stalled.contains(&(request.queue, message));
            if !(request.delivered || queued || parked || stalled) {
                return Err(InvariantViolation::LostRequest { message });
            }
        }

        let loans = self.pool.loans_outstanding();
        if loans != self.in_flight.len() {
            return Err(InvariantViolation::SlotLeak {
                loans,
                requests: self.in_flight.len(),
            });
        }
        Ok(())
    }
}

impl Default for SimulatedKernel {
    fn default() -> Self {
        Self::new(KernelConfig::default())
    }
}

impl KernelApi for SimulatedKernel {
    fn create_thread(&mut self, params: ThreadParams) -> Result<ThreadId, KernelError> {
        self.sys_create_thread(params)
    }

    fn join_thread(&mut self, thread: ThreadId, out: u32) -> Result<Blocking<i32>, KernelError> {
        self.sys_join_thread(thread, out)
    }

    fn cancel_thread(
        &mut self,
        thread: ThreadId,
        return_value: i32,
    ) -> Result<Blocking<()>, KernelError> {
        self.sys_cancel_thread(thread, return_value)
    }

    fn thread_id(&self) -> ThreadId {
        self.scheduler.current().unwrap_or(ThreadId::CURRENT)
    }

    fn process_id(&self) -> ProcessId {
        self.caller_process()
    }

    fn start_thread(&mut self, thread: ThreadId) -> Result<(), KernelError> {
        self.sys_start_thread(thread)
    }

    fn suspend_thread(&mut self, thread: ThreadId) -> Result<Blocking<()>, KernelError> {
        self.sys_suspend_thread(thread)
    }

    fn yield_thread(&mut self) {
        self.sys_yield_thread()
    }

    fn thread_priority(&self, thread: ThreadId) -> Result<u8, KernelError> {
        self.sys_thread_priority(thread)
    }

    fn set_thread_priority(&mut self, thread: ThreadId, priority: u8) -> Result<(), KernelError> {
        self.sys_set_thread_priority(thread, priority)
    }

    fn create_message_queue(&mut self, buffer: u32, capacity: u32) -> Result<QueueId, KernelError> {
        self.sys_create_message_queue(buffer, capacity)
    }

    fn destroy_message_queue(&mut self, queue: QueueId) -> Result<(), KernelError> {
        self.sys_destroy_message_queue(queue)
    }

    fn send_message(
        &mut self,
        queue: QueueId,
        message: u32,
        flags: u32,
    ) -> Result<Blocking<()>, KernelError> {
        self.sys_send_message(queue, message, flags)
    }

    fn jam_message(
        &mut self,
        queue: QueueId,
        message: u32,
        flags: u32,
    ) -> Result<Blocking<()>, KernelError> {
        self.sys_jam_message(queue, message, flags)
    }

    fn receive_message(
        &mut self,
        queue: QueueId,
        out: u32,
        flags: u32,
    ) -> Result<Blocking<u32>, KernelError> {
        self.sys_receive_message(queue, out, flags)
    }

    fn register_event_handler(
        &mut self,
        device: u32,
        queue: QueueId,
        message: u32,
    ) -> Result<(), KernelError> {
        self.sys_register_event_handler(device, queue, message)
    }

    fn unregister_event_handler(&mut self, device: u32) -> Result<(), KernelError> {
        self.sys_unregister_event_handler(device)
    }

    fn create_timer(
        &mut self,
        delay_us: u32,
        period_us: u32,
        queue: QueueId,
        message: u32,
    ) -> Result<TimerId, KernelError> {
        self.sys_create_timer(delay_us, period_us, queue, message)
    }

    fn restart_timer(
        &mut self,
        timer: TimerId,
        delay_us: u32,
        period_us: u32,
    ) -> Result<(), KernelError> {
        self.sys_restart_timer(timer, delay_us, period_us)
    }

    fn stop_timer(&mut self, timer: TimerId) -> Result<(), KernelError> {
        self.sys_stop_timer(timer)
    }

    fn destroy_timer(&mut self, timer: TimerId) -> Result<(), KernelError> {
        self.sys_destroy_timer(timer)
    }

    fn time(&self) -> Instant {
        self.sys_time()
    }

    fn create_heap(&mut self, buffer: u32, size: u32) -> Result<HeapId, KernelError> {
        self.sys_create_heap(buffer, size)
    }

    fn destroy_heap(&mut self, heap: HeapId) -> Result<(), KernelError> {
        self.sys_destroy_heap(heap)
    }

    fn allocate_on_heap(&mut self, heap: HeapId, size: u32) -> Result<u32, KernelError> {
        self.sys_allocate_on_heap(heap, size, HEAP_GRANULE)
    }

    fn allocate_aligned_on_heap(
        &mut self,
        heap: HeapId,
        size: u32,
        align: u32,
    ) -> Result<u32, KernelError> {
        self.sys_allocate_on_heap(heap, size, align)
    }

    fn free_on_heap(&mut self, heap: HeapId, ptr: u32) -> Result<(), KernelError> {
        self.sys_free_on_heap(heap, ptr)
    }

    fn register_resource_manager(
        &mut self,
        path: u32,
        queue: QueueId,
    ) -> Result<ResourceManagerId, KernelError> {
        self.sys_register_resource_manager(path, queue)
    }

    fn ipc_call(
        &mut self,
        call: IpcCall,
        completion: Completion,
    ) -> Result<Blocking<i32>, KernelError> {
        self.sys_ipc_call(call, completion)
    }

    fn resource_reply(&mut self, message: u32, result: i32) -> Result<Blocking<()>, KernelError> {
        self.sys_resource_reply(message, result)
    }

    fn uid(&self) -> u32 {
        self.sys_uid()
    }

    fn set_uid(&mut self, process: ProcessId, uid: u32) -> Result<(), KernelError> {
        self.sys_set_uid(process, uid)
    }

    fn gid(&self) -> u16 {
        self.sys_gid()
    }

    fn set_gid(&mut self, process: ProcessId, gid: u16) -> Result<(), KernelError> {
        self.sys_set_gid(process, gid)
    }
}
