//! Kernel API trait and call descriptors

use crate::{Instant, KernelError};
use core_types::{Fd, HeapId, ProcessId, QueueId, ResourceManagerId, ThreadId, TimerId};
use serde::{Deserialize, Serialize};

/// Outcome of a call that may suspend the caller
///
/// `Suspended` means the calling thread has been parked and another thread
/// is now running. The real result is written into the caller's saved `r0`
/// (and any out-parameter into its memory) when it is woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocking<T> {
    /// The call completed without suspending the caller
    Done(T),
    /// The caller is parked; its result arrives on wake-up
    Suspended,
}

impl<T> Blocking<T> {
    /// Returns true if the caller was parked
    pub fn is_suspended(&self) -> bool {
        matches!(self, Blocking::Suspended)
    }

    /// Returns the value of a completed call
    pub fn done(self) -> Option<T> {
        match self {
            Blocking::Done(value) => Some(value),
            Blocking::Suspended => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Blocking<U> {
        match self {
            Blocking::Done(value) => Blocking::Done(f(value)),
            Blocking::Suspended => Blocking::Suspended,
        }
    }
}

/// How an IPC call completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Completion {
    /// The caller blocks until the resource manager replies
    Sync,
    /// The caller continues; the reply is the caller's own 0x20-byte record,
    /// re-tagged and sent to `queue`
    Async { queue: QueueId, caller_message: u32 },
}

impl Completion {
    pub fn is_async(&self) -> bool {
        matches!(self, Completion::Async { .. })
    }
}

/// Arguments of `CreateThread`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadParams {
    pub entry: u32,
    pub arg: u32,
    /// Top of a caller-supplied stack; 0 asks the kernel for one
    pub stack_top: u32,
    pub stack_size: u32,
    pub priority: u8,
    pub detached: bool,
}

impl ThreadParams {
    /// A thread on a kernel-assigned stack
    pub fn new(entry: u32, arg: u32, priority: u8) -> Self {
        Self {
            entry,
            arg,
            stack_top: 0,
            stack_size: 0,
            priority,
            detached: false,
        }
    }

    pub fn with_stack(mut self, stack_top: u32, stack_size: u32) -> Self {
        self.stack_top = stack_top;
        self.stack_size = stack_size;
        self
    }

    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }
}

/// One IPC operation, before routing
///
/// Pointers are addresses in the caller's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpcCall {
    Open {
        path: u32,
        mode: u32,
    },
    Close {
        fd: Fd,
    },
    Read {
        fd: Fd,
        data: u32,
        length: u32,
    },
    Write {
        fd: Fd,
        data: u32,
        length: u32,
    },
    Seek {
        fd: Fd,
        offset: i32,
        whence: u32,
    },
    Ioctl {
        fd: Fd,
        ioctl: u32,
        input: u32,
        input_len: u32,
        output: u32,
        output_len: u32,
    },
    Ioctlv {
        fd: Fd,
        ioctl: u32,
        input_count: u32,
        io_count: u32,
        vectors: u32,
    },
}

impl IpcCall {
    /// Returns the descriptor the call is routed through, if any
    pub fn fd(&self) -> Option<Fd> {
        match *self {
            IpcCall::Open { .. } => None,
            IpcCall::Close { fd }
            | IpcCall::Read { fd, .. }
            | IpcCall::Write { fd, .. }
            | IpcCall::Seek { fd, .. }
            | IpcCall::Ioctl { fd, .. }
            | IpcCall::Ioctlv { fd, .. } => Some(fd),
        }
    }
}

/// The kernel API trait
///
/// Every method acts on behalf of the thread that is currently running.
/// Methods that may park the caller return [`Blocking`]; everything else
/// completes immediately. A completed call may still leave a different
/// thread running when it woke a higher-priority one.
///
/// # Example
///
/// ```
/// use kernel_api::{Blocking, KernelApi, KernelError};
///
/// fn echo_once<K: KernelApi>(kernel: &mut K) -> Result<(), KernelError> {
///     let queue = kernel.create_message_queue(0x1380_0000, 4)?;
///     kernel.send_message(queue, 0xCAFE, 0)?;
///     if let Blocking::Done(message) = kernel.receive_message(queue, 0x1380_0010, 0)? {
///         assert_eq!(message, 0xCAFE);
///     }
///     Ok(())
/// }
/// ```
pub trait KernelApi {
    /// Creates a Stopped thread in the caller's process
    ///
    /// The priority may not exceed the caller's creation-time ceiling.
    fn create_thread(&mut self, params: ThreadParams) -> Result<ThreadId, KernelError>;

    /// Waits for a thread to die and collects its return value
    ///
    /// Returns at once (with 0) on self or on a detached thread. `out` may be
    /// 0; otherwise the value is also stored there.
    fn join_thread(&mut self, thread: ThreadId, out: u32) -> Result<Blocking<i32>, KernelError>;

    /// Stops a thread and stores its return value
    ///
    /// Cancelling the caller never returns to it.
    fn cancel_thread(
        &mut self,
        thread: ThreadId,
        return_value: i32,
    ) -> Result<Blocking<()>, KernelError>;

    fn thread_id(&self) -> ThreadId;

    fn process_id(&self) -> ProcessId;

    /// Makes a Stopped thread Ready
    fn start_thread(&mut self, thread: ThreadId) -> Result<(), KernelError>;

    /// Takes a thread out of scheduling without destroying it
    fn suspend_thread(&mut self, thread: ThreadId) -> Result<Blocking<()>, KernelError>;

    /// Gives other threads of equal or higher priority a chance to run
    fn yield_thread(&mut self);

    fn thread_priority(&self, thread: ThreadId) -> Result<u8, KernelError>;

    fn set_thread_priority(&mut self, thread: ThreadId, priority: u8) -> Result<(), KernelError>;

    /// Creates a queue over a caller-owned buffer of `capacity` words
    fn create_message_queue(&mut self, buffer: u32, capacity: u32)
        -> Result<QueueId, KernelError>;

    fn destroy_message_queue(&mut self, queue: QueueId) -> Result<(), KernelError>;

    /// Appends a message; blocks on a full queue unless `flags` bit 0 is set
    fn send_message(
        &mut self,
        queue: QueueId,
        message: u32,
        flags: u32,
    ) -> Result<Blocking<()>, KernelError>;

    /// Inserts a message at the front of the queue
    fn jam_message(
        &mut self,
        queue: QueueId,
        message: u32,
        flags: u32,
    ) -> Result<Blocking<()>, KernelError>;

    /// Takes the oldest message; blocks on an empty queue unless `flags` bit 0 is set
    ///
    /// The message is stored at `out`, which must be non-zero and writable.
    fn receive_message(
        &mut self,
        queue: QueueId,
        out: u32,
        flags: u32,
    ) -> Result<Blocking<u32>, KernelError>;

    fn register_event_handler(
        &mut self,
        device: u32,
        queue: QueueId,
        message: u32,
    ) -> Result<(), KernelError>;

    fn unregister_event_handler(&mut self, device: u32) -> Result<(), KernelError>;

    /// Sends `message` to `queue` after `delay_us`, then every `period_us` (0 = once)
    fn create_timer(
        &mut self,
        delay_us: u32,
        period_us: u32,
        queue: QueueId,
        message: u32,
    ) -> Result<TimerId, KernelError>;

    fn restart_timer(
        &mut self,
        timer: TimerId,
        delay_us: u32,
        period_us: u32,
    ) -> Result<(), KernelError>;

    fn stop_timer(&mut self, timer: TimerId) -> Result<(), KernelError>;

    fn destroy_timer(&mut self, timer: TimerId) -> Result<(), KernelError>;

    fn time(&self) -> Instant;

    fn create_heap(&mut self, buffer: u32, size: u32) -> Result<HeapId, KernelError>;

    fn destroy_heap(&mut self, heap: HeapId) -> Result<(), KernelError>;

    fn allocate_on_heap(&mut self, heap: HeapId, size: u32) -> Result<u32, KernelError>;

    fn allocate_aligned_on_heap(
        &mut self,
        heap: HeapId,
        size: u32,
        align: u32,
    ) -> Result<u32, KernelError>;

    fn free_on_heap(&mut self, heap: HeapId, ptr: u32) -> Result<(), KernelError>;

    /// Binds the NUL-terminated path at `path` to one of the caller's queues
    fn register_resource_manager(
        &mut self,
        path: u32,
        queue: QueueId,
    ) -> Result<ResourceManagerId, KernelError>;

    /// Routes one IPC operation to its resource manager
    ///
    /// Validation failures are returned before anything is dispatched. A
    /// synchronous call then suspends until the reply; its result (for an
    /// open, the new fd) lands in the caller's `r0`. An asynchronous call
    /// returns `Done(0)` once dispatched.
    fn ipc_call(
        &mut self,
        call: IpcCall,
        completion: Completion,
    ) -> Result<Blocking<i32>, KernelError>;

    /// Answers the message at address `message` with `result`
    fn resource_reply(&mut self, message: u32, result: i32)
        -> Result<Blocking<()>, KernelError>;

    fn uid(&self) -> u32;

    fn set_uid(&mut self, process: ProcessId, uid: u32) -> Result<(), KernelError>;

    fn gid(&self) -> u16;

    fn set_gid(&mut self, process: ProcessId, gid: u16) -> Result<(), KernelError>;

    fn open_fd(&mut self, path: u32, mode: u32) -> Result<Blocking<i32>, KernelError> {
        self.ipc_call(IpcCall::Open { path, mode }, Completion::Sync)
    }

    fn close_fd(&mut self, fd: Fd) -> Result<Blocking<i32>, KernelError> {
        self.ipc_call(IpcCall::Close { fd }, Completion::Sync)
    }

    fn read_fd(&mut self, fd: Fd, data: u32, length: u32) -> Result<Blocking<i32>, KernelError> {
        self.ipc_call(IpcCall::Read { fd, data, length }, Completion::Sync)
    }

    fn write_fd(&mut self, fd: Fd, data: u32, length: u32) -> Result<Blocking<i32>, KernelError> {
        self.ipc_call(IpcCall::Write { fd, data, length }, Completion::Sync)
    }

    fn seek_fd(&mut self, fd: Fd, offset: i32, whence: u32) -> Result<Blocking<i32>, KernelError> {
        self.ipc_call(IpcCall::Seek { fd, offset, whence }, Completion::Sync)
    }

    fn ioctl_fd(
        &mut self,
        fd: Fd,
        ioctl: u32,
        input: (u32, u32),
        output: (u32, u32),
    ) -> Result<Blocking<i32>, KernelError> {
        self.ipc_call(
            IpcCall::Ioctl {
                fd,
                ioctl,
                input: input.0,
                input_len: input.1,
                output: output.0,
                output_len: output.1,
            },
            Completion::Sync,
        )
    }

    fn ioctlv_fd(
        &mut self,
        fd: Fd,
        ioctl: u32,
        input_count: u32,
        io_count: u32,
        vectors: u32,
    ) -> Result<Blocking<i32>, KernelError> {
        self.ipc_call(
            IpcCall::Ioctlv {
                fd,
                ioctl,
                input_count,
                io_count,
                vectors,
            },
            Completion::Sync,
        )
    }

    fn open_fd_async(
        &mut self,
        path: u32,
        mode: u32,
        queue: QueueId,
        caller_message: u32,
    ) -> Result<Blocking<i32>, KernelError> {
        self.ipc_call(
            IpcCall::Open { path, mode },
            Completion::Async {
                queue,
                caller_message,
            },
        )
    }

    fn close_fd_async(
        &mut self,
        fd: Fd,
        queue: QueueId,
        caller_message: u32,
    ) -> Result<Blocking<i32>, KernelError> {
        self.ipc_call(
            IpcCall::Close { fd },
            Completion::Async {
                queue,
                caller_message,
            },
        )
    }

    fn read_fd_async(
        &mut self,
        fd: Fd,
        data: u32,
        length: u32,
        queue: QueueId,
        caller_message: u32,
    ) -> Result<Blocking<i32>, KernelError> {
        self.ipc_call(
            IpcCall::Read { fd, data, length },
            Completion::Async {
                queue,
                caller_message,
            },
        )
    }

    fn write_fd_async(
        &mut self,
        fd: Fd,
        data: u32,
        length: u32,
        queue: QueueId,
        caller_message: u32,
    ) -> Result<Blocking<i32>, KernelError> {
        self.ipc_call(
            IpcCall::Write { fd, data, length },
            Completion::Async {
                queue,
                caller_message,
            },
        )
    }

    fn seek_fd_async(
        &mut self,
        fd: Fd,
        offset: i32,
        whence: u32,
        queue: QueueId,
        caller_message: u32,
    ) -> Result<Blocking<i32>, KernelError> {
        self.ipc_call(
            IpcCall::Seek { fd, offset, whence },
            Completion::Async {
                queue,
                caller_message,
            },
        )
    }

    fn ioctl_fd_async(
        &mut self,
        fd: Fd,
        ioctl: u32,
        input: (u32, u32),
        output: (u32, u32),
        queue: QueueId,
        caller_message: u32,
    ) -> Result<Blocking<i32>, KernelError> {
        self.ipc_call(
            IpcCall::Ioctl {
                fd,
                ioctl,
                input: input.0,
                input_len: input.1,
                output: output.0,
                output_len: output.1,
            },
            Completion::Async {
                queue,
                caller_message,
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn ioctlv_fd_async(
        &mut self,
        fd: Fd,
        ioctl: u32,
        input_count: u32,
        io_count: u32,
        vectors: u32,
        queue: QueueId,
        caller_message: u32,
    ) -> Result<Blocking<i32>, KernelError> {
        self.ipc_call(
            IpcCall::Ioctlv {
                fd,
                ioctl,
                input_count,
                io_count,
                vectors,
            },
            Completion::Async {
                queue,
                caller_message,
            },
        )
    }
}
