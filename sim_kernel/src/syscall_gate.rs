//! Syscall gate
//!
//! The only way a user thread enters the kernel. The gate reads the call's
//! arguments from the caller's saved registers and stack, runs the call
//! through [`KernelApi`] and stores the `i32` result in the caller's `r0`.
//!
//! Arguments one to four come from `r0..r3`. Further arguments are
//! big-endian words at `sp`, `sp + 4`, ... and are read through the same
//! pointer check as any other user buffer. A caller that is parked by the
//! call gets its `r0` when it is woken instead.

use crate::SimulatedKernel;
use core_types::{Fd, HeapId, ProcessId, QueueId, ThreadId, TimerId};
use core_types::AccessKind;
use kernel_api::{
    result_code, ArgLocation, Blocking, Completion, IpcCall, KernelApi, KernelError,
    SyscallNumber, ThreadParams, EINVAL,
};
use log::debug;
use serde::{Deserialize, Serialize};

/// Distance from a synchronous IPC call to its asynchronous twin
const ASYNC_OFFSET: u32 = SyscallNumber::OpenFdAsync as u32 - SyscallNumber::OpenFd as u32;

/// What the gate did with a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// The call completed; the value is also in the caller's `r0`
    Returned(i32),
    /// The caller is parked
    Suspended,
}

/// Syscall audit event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyscallEvent {
    Invoked {
        caller: ThreadId,
        syscall: String,
        args: Vec<u32>,
    },
    Completed {
        caller: ThreadId,
        syscall: String,
        result: i32,
    },
    Suspended {
        caller: ThreadId,
        syscall: String,
    },
    /// Rejected before dispatch: unknown number or unreadable arguments
    Rejected {
        caller: ThreadId,
        number: u32,
        result: i32,
    },
}

fn returned(result: Result<i32, KernelError>) -> SyscallOutcome {
    SyscallOutcome::Returned(result_code(result))
}

fn blocking<T>(
    result: Result<Blocking<T>, KernelError>,
    value: impl FnOnce(T) -> i32,
) -> SyscallOutcome {
    match result {
        Ok(Blocking::Done(done)) => SyscallOutcome::Returned(value(done)),
        Ok(Blocking::Suspended) => SyscallOutcome::Suspended,
        Err(error) => SyscallOutcome::Returned(error.code()),
    }
}

fn thread_arg(raw: u32) -> Result<ThreadId, KernelError> {
    ThreadId::from_raw(raw).ok_or(KernelError::InvalidArgument("thread id out of range"))
}

fn priority_arg(raw: u32) -> Result<u8, KernelError> {
    u8::try_from(raw).map_err(|_| KernelError::InvalidArgument("priority out of range"))
}

fn process_arg(raw: u32) -> Result<ProcessId, KernelError> {
    ProcessId::new(raw).ok_or(KernelError::InvalidArgument("process id out of range"))
}

/// Decodes the arguments of an IPC syscall
fn ipc_request(call: SyscallNumber, a: &[u32]) -> Option<(IpcCall, Completion)> {
    let number = call.as_u32();
    let (sync, completion) = if number >= SyscallNumber::OpenFdAsync.as_u32()
        && number <= SyscallNumber::IoctlvFdAsync.as_u32()
    {
        let n = call.arity();
        let completion = Completion::Async {
            queue: QueueId::from_raw(a[n - 2]),
            caller_message: a[n - 1],
        };
        (SyscallNumber::from_raw(number - ASYNC_OFFSET)?, completion)
    } else {
        (call, Completion::Sync)
    };
    let fd = Fd::from_raw(a[0]);
    let ipc = match sync {
        SyscallNumber::OpenFd => IpcCall::Open {
            path: a[0],
            mode: a[1],
        },
        SyscallNumber::CloseFd => IpcCall::Close { fd },
        SyscallNumber::ReadFd => IpcCall::Read {
            fd,
            data: a[1],
            length: a[2],
        },
        SyscallNumber::WriteFd => IpcCall::Write {
            fd,
            data: a[1],
            length: a[2],
        },
        SyscallNumber::SeekFd => IpcCall::Seek {
            fd,
            offset: a[1] as i32,
            whence: a[2],
        },
        SyscallNumber::IoctlFd => IpcCall::Ioctl {
            fd,
            ioctl: a[1],
            input: a[2],
            input_len: a[3],
            output: a[4],
            output_len: a[5],
        },
        SyscallNumber::IoctlvFd => IpcCall::Ioctlv {
            fd,
            ioctl: a[1],
            input_count: a[2],
            io_count: a[3],
            vectors: a[4],
        },
        _ => return None,
    };
    Some((ipc, completion))
}

impl SimulatedKernel {
    /// Executes syscall `number` for the running thread
    pub fn syscall(&mut self, number: u32) -> SyscallOutcome {
        let Ok(caller) = self.caller() else {
            return SyscallOutcome::Returned(EINVAL);
        };
        let Some(call) = SyscallNumber::from_raw(number) else {
            return self.reject(caller, number, EINVAL);
        };
        let args = match self.syscall_args(caller, call.arity()) {
            Ok(args) => args,
            Err(error) => return self.reject(caller, number, error.code()),
        };
        self.syscall_audit.record(SyscallEvent::Invoked {
            caller,
            syscall: call.name().to_string(),
            args: args.clone(),
        });

        let outcome = self.dispatch_syscall(call, &args);
        match outcome {
            SyscallOutcome::Returned(result) => {
                if let Some(thread) = self.scheduler.thread_mut(caller) {
                    thread.context.set_return_value(result);
                }
                self.syscall_audit.record(SyscallEvent::Completed {
                    caller,
                    syscall: call.name().to_string(),
                    result,
                });
            }
            SyscallOutcome::Suspended => {
                self.syscall_audit.record(SyscallEvent::Suspended {
                    caller,
                    syscall: call.name().to_string(),
                });
            }
        }
        outcome
    }

    fn reject(&mut self, caller: ThreadId, number: u32, result: i32) -> SyscallOutcome {
        debug!("syscall {:#x} from {} rejected: {}", number, caller, result);
        if let Some(thread) = self.scheduler.thread_mut(caller) {
            thread.context.set_return_value(result);
        }
        self.syscall_audit.record(SyscallEvent::Rejected {
            caller,
            number,
            result,
        });
        SyscallOutcome::Returned(result)
    }

    /// Reads `count` argument words from the caller's registers and stack
    fn syscall_args(&mut self, caller: ThreadId, count: usize) -> Result<Vec<u32>, KernelError> {
        let (context, process) = self
            .scheduler
            .thread(caller)
            .map(|t| (t.context, t.process))
            .ok_or(KernelError::InvalidArgument("no running thread"))?;
        (0..count)
            .map(|index| match ArgLocation::of(index) {
                ArgLocation::Register(register) => Ok(context.register(register)),
                ArgLocation::Stack { offset } => {
                    let addr = context
                        .sp
                        .checked_add(offset)
                        .ok_or(KernelError::AccessDenied("stack argument wraps"))?;
                    self.mmu
                        .check_memory_pointer(addr, 4, AccessKind::Read, process, process)?;
                    Ok(self.memory.read_u32(addr))
                }
            })
            .collect()
    }

    fn dispatch_syscall(&mut self, call: SyscallNumber, a: &[u32]) -> SyscallOutcome {
        use SyscallNumber as S;

        match call {
            S::CreateThread => returned(priority_arg(a[4]).and_then(|priority| {
                let params = ThreadParams {
                    entry: a[0],
                    arg: a[1],
                    stack_top: a[2],
                    stack_size: a[3],
                    priority,
                    detached: a[5] != 0,
                };
                self.create_thread(params).map(|t| t.as_u32() as i32)
            })),
            S::JoinThread => blocking(
                thread_arg(a[0]).and_then(|t| self.join_thread(t, a[1])),
                |_| 0,
            ),
            S::CancelThread => blocking(
                thread_arg(a[0]).and_then(|t| self.cancel_thread(t, a[1] as i32)),
                |()| 0,
            ),
            S::GetThreadId => SyscallOutcome::Returned(self.thread_id().as_u32() as i32),
            S::GetProcessId => SyscallOutcome::Returned(self.process_id().as_u32() as i32),
            S::StartThread => returned(thread_arg(a[0]).and_then(|t| self.start_thread(t)).map(|()| 0)),
            S::SuspendThread => blocking(
                thread_arg(a[0]).and_then(|t| self.suspend_thread(t)),
                |()| 0,
            ),
            S::YieldThread => {
                self.yield_thread();
                SyscallOutcome::Returned(0)
            }
            S::GetThreadPriority => returned(
                thread_arg(a[0])
                    .and_then(|t| self.thread_priority(t))
                    .map(i32::from),
            ),
            S::SetThreadPriority => returned(
                thread_arg(a[0])
                    .and_then(|t| Ok((t, priority_arg(a[1])?)))
                    .and_then(|(t, p)| self.set_thread_priority(t, p))
                    .map(|()| 0),
            ),
            S::CreateMessageQueue => returned(
                self.create_message_queue(a[0], a[1])
                    .map(|q| q.as_u32() as i32),
            ),
            S::DestroyMessageQueue => returned(
                self.destroy_message_queue(QueueId::from_raw(a[0]))
                    .map(|()| 0),
            ),
            S::SendMessage => blocking(
                self.send_message(QueueId::from_raw(a[0]), a[1], a[2]),
                |()| 0,
            ),
            S::JamMessage => blocking(
                self.jam_message(QueueId::from_raw(a[0]), a[1], a[2]),
                |()| 0,
            ),
            S::ReceiveMessage => blocking(
                self.receive_message(QueueId::from_raw(a[0]), a[1], a[2]),
                |_| 0,
            ),
            S::RegisterEventHandler => returned(
                self.register_event_handler(a[0], QueueId::from_raw(a[1]), a[2])
                    .map(|()| 0),
            ),
            S::UnregisterEventHandler => {
                returned(self.unregister_event_handler(a[0]).map(|()| 0))
            }
            S::CreateTimer => returned(
                self.create_timer(a[0], a[1], QueueId::from_raw(a[2]), a[3])
                    .map(|t| t.as_u32() as i32),
            ),
            S::RestartTimer => returned(
                self.restart_timer(TimerId::from_raw(a[0]), a[1], a[2])
                    .map(|()| 0),
            ),
            S::StopTimer => returned(self.stop_timer(TimerId::from_raw(a[0])).map(|()| 0)),
            S::DestroyTimer => returned(self.destroy_timer(TimerId::from_raw(a[0])).map(|()| 0)),
            S::GetTime => SyscallOutcome::Returned(self.time().as_counter() as i32),
            S::CreateHeap => returned(self.create_heap(a[0], a[1]).map(|h| h.as_u32() as i32)),
            S::DestroyHeap => returned(self.destroy_heap(HeapId::from_raw(a[0])).map(|()| 0)),
            S::AllocateOnHeap => returned(
                self.allocate_on_heap(HeapId::from_raw(a[0]), a[1])
                    .map(|p| p as i32),
            ),
            S::AllocateAlignedOnHeap => returned(
                self.allocate_aligned_on_heap(HeapId::from_raw(a[0]), a[1], a[2])
                    .map(|p| p as i32),
            ),
            S::FreeOnHeap => returned(
                self.free_on_heap(HeapId::from_raw(a[0]), a[1])
                    .map(|()| 0),
            ),
            S::RegisterResourceManager => returned(
                self.register_resource_manager(a[0], QueueId::from_raw(a[1]))
                    .map(|rm| rm.as_u32() as i32),
            ),
            S::OpenFd
            | S::CloseFd
            | S::ReadFd
            | S::WriteFd
            | S::SeekFd
            | S::IoctlFd
            | S::IoctlvFd
            | S::OpenFdAsync
            | S::CloseFdAsync
            | S::ReadFdAsync
            | S::WriteFdAsync
            | S::SeekFdAsync
            | S::IoctlFdAsync
            | S::IoctlvFdAsync => match ipc_request(call, a) {
                Some((ipc, completion)) => blocking(self.ipc_call(ipc, completion), |v| v),
                None => SyscallOutcome::Returned(EINVAL),
            },
            S::ResourceReply => blocking(self.resource_reply(a[0], a[1] as i32), |()| 0),
            S::SetUid => returned(
                process_arg(a[0])
                    .and_then(|p| self.set_uid(p, a[1]))
                    .map(|()| 0),
            ),
            S::GetUid => SyscallOutcome::Returned(self.uid() as i32),
            S::SetGid => returned(
                process_arg(a[0])
                    .and_then(|p| {
                        let gid = u16::try_from(a[1])
                            .map_err(|_| KernelError::InvalidArgument("gid out of range"))?;
                        self.set_gid(p, gid)
                    })
                    .map(|()| 0),
            ),
            S::GetGid => SyscallOutcome::Returned(i32::from(self.gid())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SyscallEvent, SyscallOutcome};
    use crate::test_utils::TestSystem;
    use kernel_api::{KernelApi, SyscallNumber, EACCES, EINVAL};

    fn set_args(sys: &mut TestSystem, args: &[u32]) {
        let current = sys.kernel.thread_id();
        let context = sys.kernel.thread_context_mut(current).unwrap();
        for (index, value) in args.iter().enumerate().take(4) {
            context.set_register(index, *value);
        }
    }

    #[test]
    fn test_unknown_number_is_einval() {
        let mut sys = TestSystem::new();
        assert_eq!(sys.kernel.syscall(0x2F), SyscallOutcome::Returned(EINVAL));
        assert_eq!(sys.context(sys.main).return_value(), EINVAL);
        assert!(sys
            .kernel
            .syscall_audit()
            .has_event(|e| matches!(e, SyscallEvent::Rejected { number: 0x2F, .. })));
    }

    #[test]
    fn test_register_arguments() {
        let mut sys = TestSystem::new();
        let buffer = sys.alloc_kernel(16);
        set_args(&mut sys, &[buffer, 4]);
        let outcome = sys.kernel.syscall(SyscallNumber::CreateMessageQueue.as_u32());
        assert_eq!(outcome, SyscallOutcome::Returned(0));
        assert!(sys.kernel.queue(core_types::QueueId::from_index(0)).is_some());

        assert_eq!(
            sys.kernel.syscall(SyscallNumber::GetThreadId.as_u32()),
            SyscallOutcome::Returned(sys.main.as_u32() as i32)
        );
        assert_eq!(sys.context(sys.main).return_value(), sys.main.as_u32() as i32);
    }

    #[test]
    fn test_fifth_argument_comes_from_stack() {
        let mut sys = TestSystem::new();
        let user = sys.spawn(1, 60);
        sys.focus(user);
        let stack = sys.alloc(1, 8);
        sys.kernel.memory_mut().write_u32(stack, 40);
        sys.kernel.memory_mut().write_u32(stack + 4, 1);
        set_args(&mut sys, &[0x2000, 7, 0, 0]);
        sys.kernel.thread_context_mut(user).unwrap().sp = stack;

        let SyscallOutcome::Returned(raw) = sys.kernel.syscall(SyscallNumber::CreateThread.as_u32())
        else {
            panic!("create never suspends");
        };
        let created = sys.kernel.thread(core_types::ThreadId::from_index(raw as usize)).unwrap();
        assert_eq!(created.priority, 40);
        assert!(created.detached);
        assert_eq!(created.process, sys.pid(1));
    }

    #[test]
    fn test_unreadable_stack_argument_is_eacces() {
        let mut sys = TestSystem::new();
        let user = sys.spawn(1, 60);
        sys.focus(user);
        let foreign = sys.alloc(2, 8);
        sys.kernel.thread_context_mut(user).unwrap().sp = foreign;
        assert_eq!(
            sys.kernel.syscall(SyscallNumber::CreateThread.as_u32()),
            SyscallOutcome::Returned(EACCES)
        );
        assert_eq!(sys.context(user).return_value(), EACCES);
    }

    #[test]
    fn test_blocking_call_completes_on_wake() {
        let mut sys = TestSystem::new();
        let receiver = sys.spawn(1, 60);
        sys.focus(receiver);
        let buffer = sys.alloc(1, 8);
        let out = sys.alloc(1, 4);
        let queue = sys.kernel.create_message_queue(buffer, 2).unwrap();
        set_args(&mut sys, &[queue.as_u32(), out, 0]);
        assert_eq!(
            sys.kernel.syscall(SyscallNumber::ReceiveMessage.as_u32()),
            SyscallOutcome::Suspended
        );

        sys.focus(sys.main);
        sys.kernel.send_message(queue, 0x55, 0).unwrap();
        assert_eq!(sys.context(receiver).return_value(), 0);
        assert_eq!(sys.kernel.memory().read_u32(out), 0x55);
        assert!(sys
            .kernel
            .syscall_audit()
            .has_event(|e| matches!(e, SyscallEvent::Suspended { .. })));
    }

    #[test]
    fn test_out_of_range_priority_rejected() {
        let mut sys = TestSystem::new();
        set_args(&mut sys, &[0, 300]);
        assert_eq!(
            sys.kernel.syscall(SyscallNumber::SetThreadPriority.as_u32()),
            SyscallOutcome::Returned(EINVAL)
        );
    }

    #[test]
    fn test_get_time_reports_low_word() {
        let mut sys = TestSystem::new();
        sys.kernel.advance_time(kernel_api::Duration::from_micros(0x1_0000_0005));
        assert_eq!(
            sys.kernel.syscall(SyscallNumber::GetTime.as_u32()),
            SyscallOutcome::Returned(5)
        );
    }
}
