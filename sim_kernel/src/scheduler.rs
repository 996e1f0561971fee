//! # Thread Scheduler
//!
//! Single core, strict priority, cooperative at blocking calls.
//!
//! ## Rules
//!
//! - Exactly one thread is Running, or none while every thread waits.
//! - The ready queue breaks ties LIFO: a thread queued at priority `p` runs
//!   before threads already queued at `p`.
//! - Whenever an operation makes a thread Ready, a Ready thread that
//!   outranks the Running one takes the CPU before the operation returns.
//! - A thread is linked into at most one queue, named by its [`WaitSite`].
//!
//! Every decision lands in the [`ScheduleEvent`] audit log.

use crate::audit::AuditLog;
use crate::layout::{STACK_POOL_BASE, THREAD_EXIT_TRAMPOLINE};
use crate::thread::{BlockedOp, Thread, ThreadState, WaitSite, CPSR_SYSTEM, CPSR_USER};
use crate::thread_queue::ThreadQueue;
use crate::SimulatedKernel;
use core_types::{AccessKind, ProcessId, ThreadId};
use hal::CriticalSection;
use kernel_api::{Blocking, KernelError, ThreadParams, EINVAL};
use log::debug;
use serde::{Deserialize, Serialize};

/// Scheduling event for the audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleEvent {
    Created {
        thread: ThreadId,
        process: ProcessId,
        priority: u8,
    },
    Started {
        thread: ThreadId,
    },
    /// A context switch
    Switched {
        from: Option<ThreadId>,
        to: ThreadId,
        process: ProcessId,
    },
    /// The running thread was displaced by a higher-priority one
    Preempted {
        thread: ThreadId,
        by: ThreadId,
    },
    Blocked {
        thread: ThreadId,
        site: WaitSite,
    },
    Woken {
        thread: ThreadId,
        result: i32,
    },
    Cancelled {
        thread: ThreadId,
        return_value: i32,
    },
    Joined {
        thread: ThreadId,
        target: ThreadId,
    },
    Suspended {
        thread: ThreadId,
    },
    PriorityChanged {
        thread: ThreadId,
        priority: u8,
    },
    /// No thread is Ready
    Idle,
}

/// Thread arena and ready queue
#[derive(Debug)]
pub struct Scheduler {
    threads: Vec<Thread>,
    ready: ThreadQueue,
    current: Option<ThreadId>,
    audit: AuditLog<ScheduleEvent>,
}

impl Scheduler {
    /// Creates an arena of `max_threads` slots; slot 0 is never allocated
    pub fn new(max_threads: usize) -> Self {
        Self {
            threads: (0..max_threads.max(2))
                .map(|index| Thread::unset(ThreadId::from_index(index)))
                .collect(),
            ready: ThreadQueue::lifo(),
            current: None,
            audit: AuditLog::new(),
        }
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(id.index()).filter(|t| !t.is_unset())
    }

    pub(crate) fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(id.index()).filter(|t| !t.is_unset())
    }

    /// Every allocated thread
    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.iter().skip(1).filter(|t| !t.is_unset())
    }

    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    pub fn ready_queue(&self) -> &ThreadQueue {
        &self.ready
    }

    pub fn audit(&self) -> &AuditLog<ScheduleEvent> {
        &self.audit
    }

    pub fn audit_mut(&mut self) -> &mut AuditLog<ScheduleEvent> {
        &mut self.audit
    }

    fn free_slot(&self) -> Option<ThreadId> {
        self.threads
            .iter()
            .skip(1)
            .find(|t| t.is_unset())
            .map(|t| t.id)
    }

    fn priority_of(&self, id: ThreadId) -> u8 {
        self.thread(id).map(|t| t.priority).unwrap_or(0)
    }
}

impl SimulatedKernel {
    /// Thread on whose behalf the current call runs
    pub(crate) fn caller(&self) -> Result<ThreadId, KernelError> {
        self.scheduler
            .current
            .ok_or(KernelError::InvalidArgument("no running thread"))
    }

    /// Process of the running thread; the kernel while idle
    pub(crate) fn caller_process(&self) -> ProcessId {
        self.scheduler
            .current
            .and_then(|id| self.scheduler.thread(id))
            .map(|t| t.process)
            .unwrap_or(ProcessId::KERNEL)
    }

    /// Resolves a syscall thread argument; 0 names the caller
    pub(crate) fn resolve_thread(&self, id: ThreadId) -> Result<ThreadId, KernelError> {
        if id.is_current_alias() {
            return self.caller();
        }
        self.scheduler
            .thread(id)
            .map(|t| t.id)
            .ok_or(KernelError::InvalidArgument("no such thread"))
    }

    /// Only the kernel may control another process's threads
    pub(crate) fn check_control(&self, target: ThreadId) -> Result<(), KernelError> {
        let caller = self.caller_process();
        match self.scheduler.thread(target) {
            Some(thread) if caller.is_kernel() || thread.process == caller => Ok(()),
            Some(_) => Err(KernelError::AccessDenied("thread belongs to another process")),
            None => Err(KernelError::InvalidArgument("no such thread")),
        }
    }

    pub(crate) fn make_ready(&mut self, id: ThreadId) {
        if let Some(thread) = self.scheduler.thread_mut(id) {
            thread.state = ThreadState::Ready;
            thread.wait = WaitSite::Ready;
            let priority = thread.priority;
            self.scheduler.ready.push(id, priority);
        }
    }

    /// Switches to the head of the ready queue
    ///
    /// The previous thread must already have left the Running state.
    pub(crate) fn schedule_yield(&mut self) {
        let from = self.scheduler.current.take();
        let Some(next) = self.scheduler.ready.pop_front() else {
            self.scheduler.audit.record(ScheduleEvent::Idle);
            return;
        };
        let process = match self.scheduler.thread_mut(next) {
            Some(thread) => {
                thread.state = ThreadState::Running;
                thread.wait = WaitSite::None;
                thread.process
            }
            None => return,
        };
        self.scheduler.current = Some(next);
        {
            let cs = CriticalSection::enter(&self.irq);
            self.mmu.activate(&cs, process);
        }
        debug!("switch {:?} -> {} ({})", from, next, process);
        self.scheduler.audit.record(ScheduleEvent::Switched {
            from,
            to: next,
            process,
        });
    }

    /// Parks the running thread at `site` and switches away
    pub(crate) fn park_current(&mut self, site: WaitSite, op: Option<BlockedOp>) {
        let Some(id) = self.scheduler.current else {
            return;
        };
        let priority = self.scheduler.priority_of(id);
        if let Some(thread) = self.scheduler.thread_mut(id) {
            thread.state = ThreadState::Waiting;
            thread.wait = site;
            thread.blocked = op;
        }
        self.link_at_site(id, priority, site);
        self.scheduler
            .audit
            .record(ScheduleEvent::Blocked { thread: id, site });
        self.scheduler.current = None;
        self.schedule_yield();
    }

    fn link_at_site(&mut self, id: ThreadId, priority: u8, site: WaitSite) {
        match site {
            WaitSite::Receivers(queue) => {
                if let Some(q) = self.queue_slot_mut(queue) {
                    q.receivers.push(id, priority);
                }
            }
            WaitSite::Senders(queue) => {
                if let Some(q) = self.queue_slot_mut(queue) {
                    q.senders.push(id, priority);
                }
            }
            WaitSite::Joiners(target) => {
                if let Some(t) = self.scheduler.thread_mut(target) {
                    t.joiners.push(id, priority);
                }
            }
            WaitSite::RelayBacklog => self.relay.backlog.push(id, priority),
            WaitSite::Ready => self.scheduler.ready.push(id, priority),
            WaitSite::Reply(_) | WaitSite::None => {}
        }
    }

    fn unlink_from_site(&mut self, id: ThreadId, site: WaitSite) {
        match site {
            WaitSite::Receivers(queue) => {
                if let Some(q) = self.queue_slot_mut(queue) {
                    q.receivers.remove(id);
                }
            }
            WaitSite::Senders(queue) => {
                if let Some(q) = self.queue_slot_mut(queue) {
                    q.senders.remove(id);
                }
            }
            WaitSite::Joiners(target) => {
                if let Some(t) = self.scheduler.thread_mut(target) {
                    t.joiners.remove(id);
                }
            }
            WaitSite::RelayBacklog => {
                self.relay.backlog.remove(id);
            }
            WaitSite::Ready => {
                self.scheduler.ready.remove(id);
            }
            WaitSite::Reply(_) | WaitSite::None => {}
        }
    }

    /// Completes a waiting thread's call with `result` and makes it Ready
    pub(crate) fn wake(&mut self, id: ThreadId, result: i32) {
        let Some(site) = self.scheduler.thread(id).map(|t| t.wait) else {
            return;
        };
        self.unlink_from_site(id, site);
        if let Some(thread) = self.scheduler.thread_mut(id) {
            thread.context.set_return_value(result);
            thread.blocked = None;
        }
        self.scheduler
            .audit
            .record(ScheduleEvent::Woken { thread: id, result });
        self.make_ready(id);
    }

    /// Moves a waiting thread to another wait site without waking it
    pub(crate) fn rehome(&mut self, id: ThreadId, site: WaitSite, op: Option<BlockedOp>) {
        let Some(old) = self.scheduler.thread(id).map(|t| t.wait) else {
            return;
        };
        self.unlink_from_site(id, old);
        let priority = self.scheduler.priority_of(id);
        if let Some(thread) = self.scheduler.thread_mut(id) {
            thread.wait = site;
            thread.blocked = op;
        }
        self.link_at_site(id, priority, site);
    }

    /// Gives the CPU to the head of the ready queue if it outranks the running thread
    pub(crate) fn preempt_if_needed(&mut self) {
        let Some((head, head_priority)) = self.scheduler.ready.peek() else {
            return;
        };
        match self.scheduler.current {
            None => self.schedule_yield(),
            Some(current) if head_priority > self.scheduler.priority_of(current) => {
                self.scheduler.audit.record(ScheduleEvent::Preempted {
                    thread: current,
                    by: head,
                });
                self.make_ready(current);
                self.schedule_yield();
            }
            Some(_) => {}
        }
    }

    /// Removes a thread from whatever it waits on, abandoning the wait
    ///
    /// A delivered synchronous request is orphaned: the resource manager
    /// may still reply, but nobody receives the result and the message slot
    /// is only released by that reply. A request still waiting for queue
    /// room is withdrawn.
    pub(crate) fn detach_from_wait_site(&mut self, id: ThreadId) {
        let Some((site, op)) = self.scheduler.thread(id).map(|t| (t.wait, t.blocked)) else {
            return;
        };
        self.unlink_from_site(id, site);
        match (site, op) {
            (WaitSite::Reply(message), _) => self.orphan_request(message),
            (WaitSite::Senders(_), Some(BlockedOp::Send { then, .. })) => {
                if let Some(message) = then.pending_request() {
                    self.abort_request(message)
                }
            }
            (WaitSite::RelayBacklog, Some(BlockedOp::Relay { record })) => {
                self.relay.deferred.push_back(record)
            }
            _ => {}
        }
        if let Some(thread) = self.scheduler.thread_mut(id) {
            thread.wait = WaitSite::None;
            thread.blocked = None;
        }
    }

    /// Allocates and initializes a Stopped thread in `process`
    pub(crate) fn spawn_thread(
        &mut self,
        process: ProcessId,
        params: ThreadParams,
        ceiling: u8,
    ) -> Result<ThreadId, KernelError> {
        if params.priority > ceiling || params.priority > self.config.max_priority {
            return Err(KernelError::InvalidArgument("priority above creator's ceiling"));
        }
        if params.stack_top != 0 && params.stack_size == 0 {
            return Err(KernelError::InvalidArgument("caller stack without a size"));
        }
        let id = self
            .scheduler
            .free_slot()
            .ok_or(KernelError::Exhausted("thread table"))?;

        let (stack_top, stack_size) = if params.stack_top == 0 {
            let size = if params.stack_size == 0 {
                self.config.default_stack_size
            } else {
                params.stack_size
            };
            let top = (id.as_u32())
                .checked_mul(size)
                .and_then(|offset| offset.checked_add(size))
                .and_then(|offset| STACK_POOL_BASE.checked_add(offset))
                .ok_or(KernelError::InvalidArgument("stack does not fit the stack pool"))?;
            (top, size)
        } else {
            (params.stack_top, params.stack_size)
        };

        let thread = self
            .scheduler
            .threads
            .get_mut(id.index())
            .ok_or(KernelError::Exhausted("thread table"))?;
        *thread = Thread::unset(id);
        thread.process = process;
        thread.state = ThreadState::Stopped;
        thread.priority = params.priority;
        thread.initial_priority = params.priority;
        thread.detached = params.detached;
        thread.stack_top = stack_top;
        thread.stack_size = stack_size;
        thread.context.gpr[0] = params.arg;
        thread.context.sp = stack_top;
        thread.context.lr = THREAD_EXIT_TRAMPOLINE;
        thread.context.pc = params.entry;
        thread.context.cpsr = if process.is_kernel() {
            CPSR_SYSTEM
        } else {
            CPSR_USER
        };

        self.pool.reset_thread(id);
        self.scheduler.audit.record(ScheduleEvent::Created {
            thread: id,
            process,
            priority: params.priority,
        });
        Ok(id)
    }

    /// Creates the kernel main thread in slot 1 and makes it Running
    pub(crate) fn boot_main_thread(&mut self) -> Result<ThreadId, KernelError> {
        let priority = self.config.max_priority;
        let main = self.spawn_thread(ProcessId::KERNEL, ThreadParams::new(0, 0, priority), priority)?;
        self.make_ready(main);
        self.schedule_yield();
        Ok(main)
    }

    pub(crate) fn sys_create_thread(&mut self, params: ThreadParams) -> Result<ThreadId, KernelError> {
        let caller = self.caller()?;
        let (process, ceiling) = self
            .scheduler
            .thread(caller)
            .map(|t| (t.process, t.initial_priority))
            .ok_or(KernelError::InvalidArgument("no running thread"))?;
        self.spawn_thread(process, params, ceiling)
    }

    /// Creates a Stopped thread in another process (module loader path)
    ///
    /// Only the kernel may call this.
    pub fn create_thread_for_process(
        &mut self,
        process: ProcessId,
        params: ThreadParams,
    ) -> Result<ThreadId, KernelError> {
        let caller = self.caller()?;
        if !self.caller_process().is_kernel() {
            return Err(KernelError::AccessDenied("only the kernel loads modules"));
        }
        let ceiling = self
            .scheduler
            .thread(caller)
            .map(|t| t.initial_priority)
            .unwrap_or(0);
        self.spawn_thread(process, params, ceiling)
    }

    pub(crate) fn sys_start_thread(&mut self, id: ThreadId) -> Result<(), KernelError> {
        let id = self.resolve_thread(id)?;
        self.check_control(id)?;
        if self.scheduler.thread(id).map(|t| t.state) != Some(ThreadState::Stopped) {
            return Err(KernelError::InvalidArgument("thread is not stopped"));
        }
        self.make_ready(id);
        self.scheduler.audit.record(ScheduleEvent::Started { thread: id });
        self.preempt_if_needed();
        Ok(())
    }

    pub(crate) fn sys_cancel_thread(
        &mut self,
        id: ThreadId,
        return_value: i32,
    ) -> Result<Blocking<()>, KernelError> {
        let id = self.resolve_thread(id)?;
        self.check_control(id)?;
        if self.scheduler.thread(id).map(|t| t.state) == Some(ThreadState::Dead) {
            return Err(KernelError::InvalidArgument("thread already dead"));
        }
        let is_self = self.scheduler.current == Some(id);

        self.detach_from_wait_site(id);
        let (detached, joiners) = match self.scheduler.thread_mut(id) {
            Some(thread) => {
                thread.return_value = return_value;
                thread.state = ThreadState::Dead;
                (thread.detached, thread.joiners.drain())
            }
            None => return Err(KernelError::InvalidArgument("no such thread")),
        };
        self.scheduler.audit.record(ScheduleEvent::Cancelled {
            thread: id,
            return_value,
        });

        let mut collected = false;
        for joiner in joiners {
            let out = match self.scheduler.thread(joiner).and_then(|t| t.blocked) {
                Some(BlockedOp::Join { out, .. }) => out,
                _ => 0,
            };
            if collected {
                self.wake(joiner, EINVAL);
            } else {
                if out != 0 {
                    self.memory.write_u32(out, return_value as u32);
                }
                self.scheduler.audit.record(ScheduleEvent::Joined {
                    thread: joiner,
                    target: id,
                });
                self.wake(joiner, 0);
                collected = true;
            }
        }
        if detached || collected {
            if let Some(thread) = self.scheduler.thread_mut(id) {
                thread.release();
            }
        }

        if is_self {
            self.scheduler.current = None;
            self.schedule_yield();
            Ok(Blocking::Suspended)
        } else {
            self.preempt_if_needed();
            Ok(Blocking::Done(()))
        }
    }

    pub(crate) fn sys_join_thread(
        &mut self,
        id: ThreadId,
        out: u32,
    ) -> Result<Blocking<i32>, KernelError> {
        let caller = self.caller()?;
        let target = self.resolve_thread(id)?;
        if target == caller {
            return Ok(Blocking::Done(0));
        }
        self.check_control(target)?;
        if out != 0 {
            let process = self.caller_process();
            self.mmu
                .check_memory_pointer(out, 4, AccessKind::Write, process, process)?;
        }
        let (state, detached, return_value) = match self.scheduler.thread(target) {
            Some(t) => (t.state, t.detached, t.return_value),
            None => return Err(KernelError::InvalidArgument("no such thread")),
        };
        if detached {
            return Ok(Blocking::Done(0));
        }
        if state == ThreadState::Dead {
            if out != 0 {
                self.memory.write_u32(out, return_value as u32);
            }
            if let Some(thread) = self.scheduler.thread_mut(target) {
                thread.release();
            }
            self.scheduler.audit.record(ScheduleEvent::Joined {
                thread: caller,
                target,
            });
            return Ok(Blocking::Done(return_value));
        }
        self.park_current(WaitSite::Joiners(target), Some(BlockedOp::Join { target, out }));
        Ok(Blocking::Suspended)
    }

    pub(crate) fn sys_suspend_thread(&mut self, id: ThreadId) -> Result<Blocking<()>, KernelError> {
        let id = self.resolve_thread(id)?;
        self.check_control(id)?;
        match self.scheduler.thread(id).map(|t| t.state) {
            Some(ThreadState::Running | ThreadState::Ready | ThreadState::Waiting) => {}
            _ => return Err(KernelError::InvalidArgument("thread is not schedulable")),
        }
        self.detach_from_wait_site(id);
        if let Some(thread) = self.scheduler.thread_mut(id) {
            thread.state = ThreadState::Stopped;
        }
        self.scheduler
            .audit
            .record(ScheduleEvent::Suspended { thread: id });
        if self.scheduler.current == Some(id) {
            self.scheduler.current = None;
            self.schedule_yield();
            Ok(Blocking::Suspended)
        } else {
            Ok(Blocking::Done(()))
        }
    }

    pub(crate) fn sys_yield_thread(&mut self) {
        if let Some(current) = self.scheduler.current {
            self.make_ready(current);
            self.schedule_yield();
        }
    }

    pub(crate) fn sys_thread_priority(&self, id: ThreadId) -> Result<u8, KernelError> {
        let id = self.resolve_thread(id)?;
        Ok(self.scheduler.priority_of(id))
    }

    pub(crate) fn sys_set_thread_priority(
        &mut self,
        id: ThreadId,
        priority: u8,
    ) -> Result<(), KernelError> {
        let id = self.resolve_thread(id)?;
        self.check_control(id)?;
        let site = match self.scheduler.thread_mut(id) {
            Some(thread) if priority <= thread.initial_priority => {
                thread.priority = priority;
                thread.wait
            }
            Some(_) => return Err(KernelError::InvalidArgument("priority above ceiling")),
            None => return Err(KernelError::InvalidArgument("no such thread")),
        };
        self.unlink_from_site(id, site);
        self.link_at_site(id, priority, site);
        self.scheduler.audit.record(ScheduleEvent::PriorityChanged {
            thread: id,
            priority,
        });
        self.preempt_if_needed();
        Ok(())
    }

    /// Forces `id` onto the CPU, re-queueing the running thread
    ///
    /// Models an interrupt handler that picks the next thread itself. The
    /// thread must be Ready.
    pub fn run_thread(&mut self, id: ThreadId) -> Result<(), KernelError> {
        if self.scheduler.thread(id).map(|t| t.state) != Some(ThreadState::Ready) {
            return Err(KernelError::InvalidArgument("thread is not ready"));
        }
        self.scheduler.ready.remove(id);
        if let Some(current) = self.scheduler.current {
            self.make_ready(current);
        }
        // Front of the queue regardless of priority
        self.scheduler.ready.push(id, u8::MAX);
        self.schedule_yield();
        Ok(())
    }
}
