//! # IPC Transport
//!
//! Open/Close/Read/Write/Seek/Ioctl/Ioctlv, synchronous and asynchronous,
//! and the replies that complete them.
//!
//! ## Request lifecycle
//!
//! ```text
//! Issued -> validated -> dispatched to the resource manager -> replied
//! ```
//!
//! - Validation reads nothing the caller may not read and fails with EACCES
//!   before anything reaches the resource manager.
//! - A dispatched request owns a message-slot lease until its reply.
//! - A synchronous caller waits at `WaitSite::Reply`. If it is cancelled or
//!   suspended the request is orphaned: the reply is still accepted, the
//!   result discarded and the slot released.
//! - An asynchronous reply re-tags the caller's own record and sends its
//!   address to the caller's callback queue.

use crate::audit::KernelEvent;
use crate::layout::PAGE_SIZE;
use crate::message_pool::{LendPolicy, SlotLease};
use crate::message_queue::PostOutcome;
use crate::thread::{AfterSend, BlockedOp, WaitSite};
use crate::SimulatedKernel;
use core_types::{AccessKind, Fd, ProcessId, QueueId, ResourceManagerId, ThreadId};
use ipc::{
    Command, IoVector, IpcMessage, IpcRequest, RawIpcRequest, RequestPayload, IO_VECTOR_SIZE,
    MAX_PATH_LEN, REQUEST_SIZE,
};
use kernel_api::{Blocking, Completion, IpcCall, KernelError};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Offset of the result word inside a request record
const RESULT_OFFSET: u32 = 0x04;

/// Offset of the in-queue flag inside a message
const IN_QUEUE_OFFSET: u32 = 0x30;

/// One entry of a per-process descriptor table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FdSlot {
    Free,
    /// Held by an open that has not been answered yet
    Reserved,
    /// Bound to a resource manager; `handle` is what its open returned
    Bound { rm: ResourceManagerId, handle: i32 },
}

/// Per-process descriptor table
#[derive(Debug, Clone)]
pub struct FdTable {
    slots: Vec<FdSlot>,
}

impl FdTable {
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![FdSlot::Free; size],
        }
    }

    pub fn get(&self, fd: usize) -> Option<FdSlot> {
        self.slots.get(fd).copied()
    }

    fn reserve(&mut self) -> Option<usize> {
        let fd = self.slots.iter().position(|s| *s == FdSlot::Free)?;
        self.slots[fd] = FdSlot::Reserved;
        Some(fd)
    }

    fn set(&mut self, fd: usize, slot: FdSlot) {
        if let Some(entry) = self.slots.get_mut(fd) {
            *entry = slot;
        }
    }

    pub fn bound(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, FdSlot::Bound { .. }))
            .count()
    }
}

/// Who is waiting for a request's result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Sync {
        thread: ThreadId,
    },
    Async {
        thread: ThreadId,
        queue: QueueId,
        caller_message: u32,
    },
    /// A request relayed from the external processor
    External {
        record: u32,
    },
}

/// Descriptor-table change applied when the reply arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FdEffect {
    None,
    Open { fd: usize },
    Close { fd: usize },
}

/// A dispatched request awaiting its reply
#[derive(Debug)]
pub struct InFlight {
    pub(crate) lease: SlotLease,
    pub command: Command,
    pub caller: ProcessId,
    /// Process that must reply
    pub owner: ProcessId,
    pub rm: ResourceManagerId,
    pub queue: QueueId,
    pub origin: Origin,
    pub effect: FdEffect,
    /// The synchronous caller stopped waiting
    pub orphaned: bool,
    /// Handed to a receiver of the resource manager's queue
    pub delivered: bool,
}

impl SimulatedKernel {
    pub(crate) fn sys_ipc_call(
        &mut self,
        call: IpcCall,
        completion: Completion,
    ) -> Result<Blocking<i32>, KernelError> {
        let thread = self.caller()?;
        let process = self.caller_process();
        let origin = match completion {
            Completion::Sync => Origin::Sync { thread },
            Completion::Async {
                queue,
                caller_message,
            } => {
                self.check_queue_access(queue, process)?;
                self.mmu.check_memory_pointer(
                    caller_message,
                    REQUEST_SIZE as u32,
                    AccessKind::Write,
                    process,
                    process,
                )?;
                Origin::Async {
                    thread,
                    queue,
                    caller_message,
                }
            }
        };

        let (message, queue) = self.dispatch(process, call, origin)?;
        match self.post_message(queue, message, false)? {
            PostOutcome::Delivered | PostOutcome::Queued => match origin {
                Origin::Sync { .. } => {
                    self.park_current(WaitSite::Reply(message), None);
                    Ok(Blocking::Suspended)
                }
                _ => {
                    self.preempt_if_needed();
                    Ok(Blocking::Done(0))
                }
            },
            PostOutcome::Full => {
                self.note_queue_full(queue, message);
                let then = match origin {
                    Origin::Sync { .. } => AfterSend::AwaitReply(message),
                    _ => AfterSend::Posted(message),
                };
                self.park_current(
                    WaitSite::Senders(queue),
                    Some(BlockedOp::Send {
                        queue,
                        message,
                        jam: false,
                        then,
                    }),
                );
                Ok(Blocking::Suspended)
            }
        }
    }

    /// Validates a call and writes its message into a leased slot
    ///
    /// Returns the message address and the queue it must be posted to.
    /// Nothing is left behind on failure.
    pub(crate) fn dispatch(
        &mut self,
        caller: ProcessId,
        call: IpcCall,
        origin: Origin,
    ) -> Result<(u32, QueueId), KernelError> {
        let (rm, handle) = match call {
            IpcCall::Open { path, .. } => {
                let name = self.read_path(caller, path)?;
                let (rm, entry) = self
                    .registry
                    .lookup(&name)
                    .ok_or(KernelError::NotFound("no resource manager for path"))?;
                if caller == ProcessId::EXTERNAL && !entry.external_access {
                    return Err(KernelError::AccessDenied("device hidden from the external processor"));
                }
                (rm, 0)
            }
            _ => {
                let fd = call
                    .fd()
                    .ok_or(KernelError::InvalidArgument("descriptor not open"))?;
                self.bound_fd(caller, fd)?
            }
        };
        let (owner, queue, path) = match self.registry.get(rm) {
            Some(entry) => (entry.owner, entry.queue, entry.path.clone()),
            None => return Err(KernelError::InvalidArgument("resource manager is gone")),
        };

        let payload = self.check_buffers(caller, owner, call)?;

        let effect = match call {
            IpcCall::Open { .. } => {
                let fd = self.fds[caller.index()]
                    .reserve()
                    .ok_or(KernelError::Exhausted("descriptor table"))?;
                FdEffect::Open { fd }
            }
            IpcCall::Close { fd } => FdEffect::Close { fd: fd.index() },
            _ => FdEffect::None,
        };

        let policy = match origin {
            Origin::Sync { thread } => LendPolicy::Sync(thread),
            Origin::Async { thread, .. } => LendPolicy::Async(thread),
            Origin::External { .. } => LendPolicy::Unowned,
        };
        let Some(lease) = self.pool.lend(policy) else {
            if let FdEffect::Open { fd } = effect {
                self.fds[caller.index()].set(fd, FdSlot::Free);
            }
            return Err(KernelError::Exhausted("message slots"));
        };

        let (callback, caller_data, used_by_thread) = match origin {
            Origin::Sync { thread } => (None, 0, Some(thread)),
            Origin::Async {
                thread,
                queue,
                caller_message,
            } => (Some(queue), caller_message, Some(thread)),
            Origin::External { record } => (None, record, None),
        };
        let message = IpcMessage {
            request: IpcRequest::new(handle, payload),
            callback,
            caller_data,
            used_by_thread,
            used_by_process: owner,
            in_queue: true,
        };
        let address = lease.address();
        self.memory.write_bytes(address, &message.encode());

        let command = payload.command();
        debug!(
            "{:?} from {} to {} ({}) at {:#010x}",
            command, caller, path, queue, address
        );
        self.in_flight.insert(
            address,
            InFlight {
                lease,
                command,
                caller,
                owner,
                rm,
                queue,
                origin,
                effect,
                orphaned: false,
                delivered: false,
            },
        );
        Ok((address, queue))
    }

    /// Reads a NUL-terminated device path the caller may read
    fn read_path(&mut self, caller: ProcessId, path: u32) -> Result<String, KernelError> {
        self.read_user_path(caller, caller, path)
    }

    /// Reads a NUL-terminated path of at most `MAX_PATH_LEN` bytes
    ///
    /// Each page is checked for both sides before any byte of it is
    /// scanned, so an unterminated path never reads past readable memory.
    pub(crate) fn read_user_path(
        &mut self,
        caller: ProcessId,
        owner: ProcessId,
        path: u32,
    ) -> Result<String, KernelError> {
        let limit = path.saturating_add(MAX_PATH_LEN as u32);
        let mut name = Vec::with_capacity(MAX_PATH_LEN);
        let mut addr = path;
        while addr < limit {
            let page_end = (addr / PAGE_SIZE + 1).saturating_mul(PAGE_SIZE);
            let chunk_end = page_end.min(limit);
            let len = chunk_end - addr;
            self.check_ipc_buffer(caller, owner, addr, len, AccessKind::Read)?;
            let chunk = self.memory.read_bytes(addr, len as usize);
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                name.extend_from_slice(&chunk[..nul]);
                if name.is_empty() {
                    return Err(KernelError::InvalidArgument("empty path"));
                }
                return Ok(String::from_utf8_lossy(&name).into_owned());
            }
            name.extend_from_slice(&chunk);
            addr = chunk_end;
        }
        Err(KernelError::InvalidArgument("path not terminated"))
    }

    fn bound_fd(&self, caller: ProcessId, fd: Fd) -> Result<(ResourceManagerId, i32), KernelError> {
        match self.fds[caller.index()].get(fd.index()) {
            Some(FdSlot::Bound { rm, handle }) => Ok((rm, handle)),
            _ => Err(KernelError::InvalidArgument("descriptor not open")),
        }
    }

    /// The pointer check for IPC payloads
    ///
    /// External callers are confined to the two relay windows and only the
    /// owner side is checked against the page table.
    pub(crate) fn check_ipc_buffer(
        &mut self,
        caller: ProcessId,
        owner: ProcessId,
        ptr: u32,
        len: u32,
        kind: AccessKind,
    ) -> Result<(), KernelError> {
        if caller == ProcessId::EXTERNAL {
            if len != 0 && !self.config.external_window_contains(ptr, len) {
                return Err(KernelError::AccessDenied("buffer outside the relay windows"));
            }
            return self
                .mmu
                .check_memory_pointer(ptr, len, kind, ProcessId::KERNEL, owner);
        }
        self.mmu.check_memory_pointer(ptr, len, kind, caller, owner)
    }

    /// Validates every buffer a call names and builds its payload
    fn check_buffers(
        &mut self,
        caller: ProcessId,
        owner: ProcessId,
        call: IpcCall,
    ) -> Result<RequestPayload, KernelError> {
        let payload = match call {
            IpcCall::Open { path, mode } => {
                self.read_user_path(caller, owner, path)?;
                let credentials = self.credentials[caller.index()];
                RequestPayload::Open {
                    path,
                    mode,
                    uid: credentials.uid,
                    gid: credentials.gid,
                }
            }
            IpcCall::Close { .. } => RequestPayload::Close,
            IpcCall::Read { data, length, .. } => {
                self.check_ipc_buffer(caller, owner, data, length, AccessKind::OwnerWrite)?;
                RequestPayload::Read { data, length }
            }
            IpcCall::Write { data, length, .. } => {
                self.check_ipc_buffer(caller, owner, data, length, AccessKind::Read)?;
                RequestPayload::Write { data, length }
            }
            IpcCall::Seek { offset, whence, .. } => RequestPayload::Seek { offset, whence },
            IpcCall::Ioctl {
                ioctl,
                input,
                input_len,
                output,
                output_len,
                ..
            } => {
                self.check_ipc_buffer(caller, owner, input, input_len, AccessKind::Read)?;
                self.check_ipc_buffer(caller, owner, output, output_len, AccessKind::OwnerWrite)?;
                RequestPayload::Ioctl {
                    ioctl,
                    input,
                    input_len,
                    output,
                    output_len,
                }
            }
            IpcCall::Ioctlv {
                ioctl,
                input_count,
                io_count,
                vectors,
                ..
            } => {
                let count = input_count
                    .checked_add(io_count)
                    .ok_or(KernelError::InvalidArgument("vector count overflows"))?;
                let bytes = count
                    .checked_mul(IO_VECTOR_SIZE as u32)
                    .ok_or(KernelError::InvalidArgument("vector count overflows"))?;
                self.check_ipc_buffer(caller, owner, vectors, bytes, AccessKind::Read)?;
                for index in 0..count {
                    let raw = self
                        .memory
                        .read_bytes(vectors + index * IO_VECTOR_SIZE as u32, IO_VECTOR_SIZE);
                    let vector = IoVector::decode(&raw)?;
                    let kind = if index < input_count {
                        AccessKind::Read
                    } else {
                        AccessKind::OwnerWrite
                    };
                    self.check_ipc_buffer(caller, owner, vector.data, vector.length, kind)?;
                }
                RequestPayload::Ioctlv {
                    ioctl,
                    input_count,
                    io_count,
                    vectors,
                }
            }
        };
        Ok(payload)
    }

    pub(crate) fn sys_resource_reply(
        &mut self,
        message: u32,
        result: i32,
    ) -> Result<Blocking<()>, KernelError> {
        let replier = self.caller()?;
        let process = self.caller_process();
        let request = self
            .in_flight
            .get(&message)
            .ok_or(KernelError::InvalidArgument("no outstanding request at address"))?;
        if request.owner != process {
            return Err(KernelError::InvalidArgument("request routed to another process"));
        }
        if self
            .queue_ref(request.queue)
            .is_ok_and(|q| q.messages().any(|m| m == message))
        {
            return Err(KernelError::InvalidArgument("request not received yet"));
        }
        Ok(self.complete_request(message, result, Some(replier)))
    }

    /// Delivers a request's result and ends its loan
    ///
    /// `replier` is the thread answering, which is backpressured when the
    /// reply cannot be delivered yet. Without one (kernel-initiated
    /// failures) an undeliverable reply is logged and dropped.
    pub(crate) fn complete_request(
        &mut self,
        message: u32,
        result: i32,
        replier: Option<ThreadId>,
    ) -> Blocking<()> {
        let Some(request) = self.in_flight.remove(&message) else {
            return Blocking::Done(());
        };
        let table = &mut self.fds[request.caller.index()];
        let value = match request.effect {
            FdEffect::Open { fd } if result >= 0 && !request.orphaned => {
                table.set(
                    fd,
                    FdSlot::Bound {
                        rm: request.rm,
                        handle: result,
                    },
                );
                fd as i32
            }
            FdEffect::Open { fd } => {
                table.set(fd, FdSlot::Free);
                result
            }
            FdEffect::Close { fd } => {
                table.set(fd, FdSlot::Free);
                result
            }
            FdEffect::None => result,
        };
        self.memory.write_u32(message + RESULT_OFFSET, result as u32);
        self.memory.write_u32(message + IN_QUEUE_OFFSET, 0);
        self.pool.release(request.lease);

        if request.orphaned {
            if let Origin::Sync { thread } = request.origin {
                debug!("reply {:#010x} for {} discarded", message, thread);
                self.kernel_events
                    .record(KernelEvent::OrphanedReply { message, thread });
            }
            return Blocking::Done(());
        }

        match request.origin {
            Origin::Sync { thread } => {
                self.wake(thread, value);
                self.preempt_if_needed();
                Blocking::Done(())
            }
            Origin::Async {
                queue,
                caller_message,
                ..
            } => {
                self.retag_record(caller_message, value);
                match self.post_message(queue, caller_message, false) {
                    Ok(PostOutcome::Delivered | PostOutcome::Queued) => {
                        self.preempt_if_needed();
                        Blocking::Done(())
                    }
                    Ok(PostOutcome::Full) => {
                        self.note_queue_full(queue, caller_message);
                        if replier.is_some() {
                            self.park_current(
                                WaitSite::Senders(queue),
                                Some(BlockedOp::Send {
                                    queue,
                                    message: caller_message,
                                    jam: false,
                                    then: AfterSend::Resume,
                                }),
                            );
                            Blocking::Suspended
                        } else {
                            warn!("reply {:#010x} dropped: {} full", caller_message, queue);
                            Blocking::Done(())
                        }
                    }
                    Err(_) => {
                        warn!("reply {:#010x} dropped: {} is gone", caller_message, queue);
                        Blocking::Done(())
                    }
                }
            }
            Origin::External { record } => {
                self.retag_record(record, value);
                self.relay_reply(record, replier)
            }
        }
    }

    /// Rewrites a caller record as the reply to itself
    pub(crate) fn retag_record(&mut self, record: u32, result: i32) {
        let bytes = self.memory.read_bytes(record, REQUEST_SIZE);
        match RawIpcRequest::read(&bytes) {
            Ok(mut raw) => {
                raw.retag_as_reply(result);
                self.memory.write_bytes(record, &raw.to_bytes());
            }
            Err(error) => warn!("cannot retag {:#010x}: {}", record, error),
        }
    }

    /// Marks a synchronous request whose caller stopped waiting
    pub(crate) fn orphan_request(&mut self, message: u32) {
        if let Some(request) = self.in_flight.get_mut(&message) {
            request.orphaned = true;
            debug!("request {:#010x} orphaned", message);
        }
    }

    /// Records that a receive of `queue` took the request at `message`
    pub(crate) fn note_delivered(&mut self, queue: QueueId, message: u32) {
        if let Some(request) = self.in_flight.get_mut(&message) {
            if request.queue == queue {
                request.delivered = true;
            }
        }
    }

    /// Withdraws a request that never reached its queue
    pub(crate) fn abort_request(&mut self, message: u32) {
        if let Some(request) = self.in_flight.remove(&message) {
            if let FdEffect::Open { fd } = request.effect {
                self.fds[request.caller.index()].set(fd, FdSlot::Free);
            }
            self.pool.release(request.lease);
        }
    }

    /// Descriptor-table entry of a process
    pub fn fd_slot(&self, process: ProcessId, fd: Fd) -> Option<FdSlot> {
        self.fds[process.index()].get(fd.index())
    }

    /// Request awaiting a reply at `message`
    pub fn in_flight(&self, message: u32) -> Option<&InFlight> {
        self.in_flight.get(&message)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Decodes the message a resource manager received
    pub fn read_message(&self, message: u32) -> Result<IpcMessage, KernelError> {
        Ok(IpcMessage::decode(
            &self.memory.read_bytes(message, ipc::MESSAGE_SIZE),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::{TestSystem, SHARED_END};
    use crate::transport::FdSlot;
    use core_types::{Fd, QueueId, ResourceManagerId, ThreadId};
    use ipc::{Command, RawIpcRequest, RequestPayload};
    use kernel_api::{Blocking, KernelApi, EACCES, EINVAL, EMAX, ENOENT};

    struct Server {
        thread: ThreadId,
        queue: QueueId,
        out: u32,
    }

    impl Server {
        /// Takes the request handed over at the last receive
        fn take(&self, sys: &mut TestSystem) -> u32 {
            sys.focus(self.thread);
            sys.kernel.memory().read_u32(self.out)
        }

        /// Replies, then waits for the next request
        fn answer(&self, sys: &mut TestSystem, message: u32, result: i32) {
            sys.kernel.resource_reply(message, result).unwrap();
            // Waking anyone lets the kernel main thread back in
            sys.focus(self.thread);
            let next = sys.kernel.receive_message(self.queue, self.out, 0).unwrap();
            assert!(next.is_suspended());
        }
    }

    /// Resource manager thread (pid 1, priority 100) waiting on its queue
    fn server(sys: &mut TestSystem, path: &str) -> Server {
        let thread = sys.spawn(1, 100);
        sys.focus(thread);
        let buffer = sys.alloc(1, 16);
        let out = sys.alloc(1, 4);
        let name = sys.write_cstr(1, path);
        let queue = sys.kernel.create_message_queue(buffer, 4).unwrap();
        sys.kernel.register_resource_manager(name, queue).unwrap();
        assert!(sys.kernel.receive_message(queue, out, 0).unwrap().is_suspended());
        Server { thread, queue, out }
    }

    /// Opens `/dev/x` from `client` and binds fd 0 to handle `handle`
    fn open(sys: &mut TestSystem, rm: &Server, client: ThreadId, handle: i32) -> Fd {
        sys.focus(client);
        let path = sys.write_cstr_shared("/dev/x");
        assert!(sys.kernel.open_fd(path, 0).unwrap().is_suspended());
        let message = rm.take(sys);
        rm.answer(sys, message, handle);
        Fd::from_raw(sys.context(client).return_value() as u32)
    }

    #[test]
    fn test_open_unknown_path() {
        let mut sys = TestSystem::new();
        let client = sys.spawn(2, 50);
        sys.focus(client);
        let path = sys.write_cstr(2, "/dev/none");
        assert_eq!(sys.kernel.open_fd(path, 0).unwrap_err().code(), ENOENT);
    }

    #[test]
    fn test_unterminated_path_rejected() {
        let mut sys = TestSystem::new();
        let client = sys.spawn(2, 50);
        sys.focus(client);
        let path = sys.alloc(2, 0x80);
        sys.kernel.memory_mut().write_bytes(path, &[b'a'; 0x80]);
        assert_eq!(sys.kernel.open_fd(path, 0).unwrap_err().code(), EINVAL);
        let empty = sys.alloc(2, 4);
        assert_eq!(sys.kernel.open_fd(empty, 0).unwrap_err().code(), EINVAL);
    }

    #[test]
    fn test_private_path_fails_pointer_check() {
        let mut sys = TestSystem::new();
        server(&mut sys, "/dev/x");
        let client = sys.spawn(2, 50);
        sys.focus(client);
        // Readable by the client, invisible to the resource manager's process
        let path = sys.write_cstr(2, "/dev/x");
        assert_eq!(sys.kernel.open_fd(path, 0).unwrap_err().code(), EACCES);
        assert_eq!(sys.kernel.in_flight_count(), 0);
        assert_eq!(sys.kernel.fd_slot(sys.pid(2), Fd::from_index(0)), Some(FdSlot::Free));
    }

    #[test]
    fn test_path_running_off_mapped_memory_rejected() {
        let mut sys = TestSystem::new();
        server(&mut sys, "/dev/x");
        let client = sys.spawn(2, 50);
        sys.focus(client);
        // Unterminated on the last mapped page; the next page is not mapped
        let path = SHARED_END - 6;
        sys.kernel.memory_mut().write_bytes(path, b"/dev/x");
        assert_eq!(sys.kernel.open_fd(path, 0).unwrap_err().code(), EACCES);
        assert_eq!(sys.kernel.in_flight_count(), 0);
        assert_eq!(sys.kernel.fd_slot(sys.pid(2), Fd::from_index(0)), Some(FdSlot::Free));
    }

    #[test]
    fn test_sync_read_round_trip() {
        let mut sys = TestSystem::new();
        let rm = server(&mut sys, "/dev/x");
        let client = sys.spawn(2, 50);

        let fd = open(&mut sys, &rm, client, 40);
        assert_eq!(fd, Fd::from_index(0));
        assert_eq!(
            sys.kernel.fd_slot(sys.pid(2), fd),
            Some(FdSlot::Bound {
                rm: ResourceManagerId::from_index(0),
                handle: 40
            })
        );

        sys.focus(client);
        let data = sys.alloc_shared(32);
        assert!(sys.kernel.read_fd(fd, data, 32).unwrap().is_suspended());
        let message = rm.take(&mut sys);
        let decoded = sys.kernel.read_message(message).unwrap();
        assert_eq!(decoded.request.command(), Command::Read);
        assert_eq!(decoded.request.handle, 40);
        assert_eq!(decoded.request.payload, RequestPayload::Read { data, length: 32 });
        assert_eq!(decoded.used_by_process, sys.pid(1));
        assert_eq!(decoded.callback, None);

        rm.answer(&mut sys, message, 32);
        assert_eq!(sys.context(client).return_value(), 32);
        assert_eq!(sys.kernel.in_flight_count(), 0);
        assert!(sys.kernel.check_invariants().is_ok());
    }

    #[test]
    fn test_reply_checks() {
        let mut sys = TestSystem::new();
        let rm = server(&mut sys, "/dev/x");
        let client = sys.spawn(2, 50);
        sys.focus(client);
        let path = sys.write_cstr_shared("/dev/x");
        sys.kernel.open_fd(path, 0).unwrap();
        let message = sys.kernel.memory().read_u32(rm.out);

        let intruder = sys.spawn(3, 120);
        sys.focus(intruder);
        assert_eq!(sys.kernel.resource_reply(message, 0).unwrap_err().code(), EINVAL);
        assert_eq!(sys.kernel.resource_reply(0x1234, 0).unwrap_err().code(), EINVAL);
        assert!(sys.kernel.in_flight(message).is_some());
    }

    #[test]
    fn test_reply_to_unreceived_request_rejected() {
        let mut sys = TestSystem::new();
        let rm = server(&mut sys, "/dev/x");
        let first = sys.spawn(2, 50);
        let second = sys.spawn(3, 50);
        let path = sys.write_cstr_shared("/dev/x");

        sys.focus(first);
        sys.kernel.open_fd(path, 0).unwrap();
        let received = rm.take(&mut sys);
        sys.focus(second);
        sys.kernel.open_fd(path, 0).unwrap();

        // The second open is still sitting in the queue
        let queued = sys.kernel.queue(rm.queue).unwrap().messages().next().unwrap();
        assert_ne!(queued, received);
        sys.focus(rm.thread);
        assert_eq!(sys.kernel.resource_reply(queued, 0).unwrap_err().code(), EINVAL);
        sys.kernel.resource_reply(received, 0).unwrap();
    }

    #[test]
    fn test_failed_open_frees_descriptor() {
        let mut sys = TestSystem::new();
        let rm = server(&mut sys, "/dev/x");
        let client = sys.spawn(2, 50);
        sys.focus(client);
        let path = sys.write_cstr_shared("/dev/x");
        sys.kernel.open_fd(path, 0).unwrap();
        assert_eq!(sys.kernel.fd_slot(sys.pid(2), Fd::from_index(0)), Some(FdSlot::Reserved));

        let message = rm.take(&mut sys);
        rm.answer(&mut sys, message, ENOENT);
        assert_eq!(sys.context(client).return_value(), ENOENT);
        assert_eq!(sys.kernel.fd_slot(sys.pid(2), Fd::from_index(0)), Some(FdSlot::Free));
    }

    #[test]
    fn test_close_unbinds() {
        let mut sys = TestSystem::new();
        let rm = server(&mut sys, "/dev/x");
        let client = sys.spawn(2, 50);
        let fd = open(&mut sys, &rm, client, 3);

        sys.focus(client);
        sys.kernel.close_fd(fd).unwrap();
        let message = rm.take(&mut sys);
        assert_eq!(sys.kernel.read_message(message).unwrap().request.handle, 3);
        rm.answer(&mut sys, message, 0);
        assert_eq!(sys.kernel.fd_slot(sys.pid(2), fd), Some(FdSlot::Free));
    }

    #[test]
    fn test_io_on_unopened_descriptor() {
        let mut sys = TestSystem::new();
        let client = sys.spawn(2, 50);
        sys.focus(client);
        let data = sys.alloc_shared(8);
        assert_eq!(sys.kernel.write_fd(Fd::from_index(3), data, 8).unwrap_err().code(), EINVAL);
        assert_eq!(sys.kernel.write_fd(Fd::from_index(999), data, 8).unwrap_err().code(), EINVAL);
    }

    #[test]
    fn test_descriptor_table_exhaustion() {
        let mut sys = TestSystem::with_config(crate::KernelConfig {
            fds_per_process: 1,
            ..Default::default()
        });
        let rm = server(&mut sys, "/dev/x");
        let client = sys.spawn(2, 50);
        open(&mut sys, &rm, client, 1);

        sys.focus(client);
        let path = sys.write_cstr_shared("/dev/x");
        assert_eq!(sys.kernel.open_fd(path, 0).unwrap_err().code(), EMAX);
    }

    #[test]
    fn test_ioctlv_checks_every_vector() {
        let mut sys = TestSystem::new();
        let rm = server(&mut sys, "/dev/x");
        let client = sys.spawn(2, 50);
        let fd = open(&mut sys, &rm, client, 1);

        sys.focus(client);
        let input = sys.alloc_shared(8);
        let private = sys.alloc(2, 8);
        let vectors = sys.alloc_shared(16);
        sys.kernel
            .memory_mut()
            .write_bytes(vectors, &ipc::IoVector::new(input, 8).encode());
        sys.kernel
            .memory_mut()
            .write_bytes(vectors + 8, &ipc::IoVector::new(private, 8).encode());
        assert_eq!(sys.kernel.ioctlv_fd(fd, 1, 1, 1, vectors).unwrap_err().code(), EACCES);
        assert_eq!(sys.kernel.ioctlv_fd(fd, 1, 1, 0, vectors).unwrap(), Blocking::Suspended);
    }

    #[test]
    fn test_async_reply_is_retagged_caller_record() {
        let mut sys = TestSystem::new();
        let rm = server(&mut sys, "/dev/x");
        let client = sys.spawn(2, 50);
        let fd = open(&mut sys, &rm, client, 7);

        sys.focus(client);
        let callback_buffer = sys.alloc(2, 16);
        let callback = sys.kernel.create_message_queue(callback_buffer, 4).unwrap();
        let record = sys.alloc(2, 0x20);
        let data = sys.alloc_shared(16);
        assert_eq!(
            sys.kernel.write_fd_async(fd, data, 16, callback, record).unwrap(),
            Blocking::Done(0)
        );
        assert_eq!(sys.kernel.message_pool().reservations(client), 1);

        // Handed straight to the waiting server
        assert!(sys.kernel.queue(rm.queue).unwrap().is_empty());
        let message = rm.take(&mut sys);
        let decoded = sys.kernel.read_message(message).unwrap();
        assert_eq!(decoded.callback, Some(callback));
        assert_eq!(decoded.caller_data, record);
        rm.answer(&mut sys, message, 16);
        assert_eq!(sys.kernel.message_pool().reservations(client), 0);

        let reply = RawIpcRequest::read(&sys.kernel.memory().read_bytes(record, 0x20)).unwrap();
        assert_eq!(reply.command.get(), Command::Reply.as_u32());
        assert_eq!(reply.result.get(), 16);
        assert_eq!(reply.handle.get(), Command::Write.as_u32() as i32);
        assert_eq!(
            sys.kernel.queue(callback).unwrap().messages().collect::<Vec<_>>(),
            vec![record]
        );
    }

    #[test]
    fn test_async_record_must_be_writable() {
        let mut sys = TestSystem::new();
        let rm = server(&mut sys, "/dev/x");
        let client = sys.spawn(2, 50);
        let fd = open(&mut sys, &rm, client, 7);

        sys.focus(client);
        let callback_buffer = sys.alloc(2, 16);
        let callback = sys.kernel.create_message_queue(callback_buffer, 4).unwrap();
        let data = sys.alloc_shared(16);
        let read_only = sys.read_only_address();
        assert_eq!(
            sys.kernel
                .write_fd_async(fd, data, 16, callback, read_only)
                .unwrap_err()
                .code(),
            EACCES
        );
        assert_eq!(sys.kernel.in_flight_count(), 0);
    }
}
