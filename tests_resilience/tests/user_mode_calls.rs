//! User-Mode Call Scenarios
//!
//! Resource-manager traffic issued through the syscall gate from a user
//! thread, with arguments split between registers and the stack.

use core_types::ThreadId;
use ipc::RequestPayload;
use kernel_api::{KernelApi, SyscallNumber, EACCES};
use sim_kernel::test_utils::TestSystem;
use sim_kernel::{SyscallEvent, SyscallOutcome};
use tests_resilience::{assert_consistent, boot, Server};

/// Loads registers and stack words the way the user-side stub would
fn stage(sys: &mut TestSystem, thread: ThreadId, args: &[u32], stack: u32) {
    for (offset, value) in args.iter().skip(4).enumerate() {
        sys.kernel
            .memory_mut()
            .write_u32(stack + offset as u32 * 4, *value);
    }
    let context = sys.kernel.thread_context_mut(thread).unwrap();
    for (index, value) in args.iter().take(4).enumerate() {
        context.set_register(index, *value);
    }
    context.sp = stack;
}

#[test]
fn test_open_then_ioctl_through_gate() {
    let (mut sys, _) = boot();
    let server = Server::start(&mut sys, 1, "/dev/gpio");
    let client = sys.spawn(2, 50);
    let stack = sys.alloc(2, 16);

    let path = sys.write_cstr_shared("/dev/gpio");
    stage(&mut sys, client, &[path, 0], stack);
    assert_eq!(
        sys.kernel.syscall(SyscallNumber::OpenFd.as_u32()),
        SyscallOutcome::Suspended
    );
    let (message, decoded) = server.request(&mut sys);
    assert!(matches!(decoded.request.payload, RequestPayload::Open { .. }));
    server.answer(&mut sys, message, 6);
    let fd = sys.context(client).return_value();
    assert_eq!(fd, 0);

    sys.focus(client);
    let input = sys.alloc_shared(8);
    let output = sys.alloc_shared(16);
    stage(&mut sys, client, &[fd as u32, 0x1234, input, 8, output, 16], stack);
    assert_eq!(
        sys.kernel.syscall(SyscallNumber::IoctlFd.as_u32()),
        SyscallOutcome::Suspended
    );
    let (message, decoded) = server.request(&mut sys);
    assert_eq!(decoded.request.handle, 6);
    assert_eq!(
        decoded.request.payload,
        RequestPayload::Ioctl {
            ioctl: 0x1234,
            input,
            input_len: 8,
            output,
            output_len: 16
        }
    );
    sys.kernel.memory_mut().write_u32(output, 0xCAFE);
    server.answer(&mut sys, message, 4);
    assert_eq!(sys.context(client).return_value(), 4);
    assert_eq!(sys.read_u32(output), 0xCAFE);

    let suspended = sys
        .kernel
        .syscall_audit()
        .count_events(|e| matches!(e, SyscallEvent::Suspended { caller, .. } if *caller == client));
    assert_eq!(suspended, 2);
    assert_consistent(&sys.kernel);
}

#[test]
fn test_private_output_rejected_before_dispatch() {
    let (mut sys, _) = boot();
    let server = Server::start(&mut sys, 1, "/dev/gpio");
    let client = sys.spawn(2, 50);
    let stack = sys.alloc(2, 16);
    let path = sys.write_cstr_shared("/dev/gpio");
    stage(&mut sys, client, &[path, 0], stack);
    sys.kernel.syscall(SyscallNumber::OpenFd.as_u32());
    let message = server.take(&mut sys);
    server.answer(&mut sys, message, 6);

    sys.focus(client);
    let input = sys.alloc_shared(8);
    // The manager's process cannot write here
    let private = sys.alloc(2, 16);
    stage(&mut sys, client, &[0, 0x1234, input, 8, private, 16], stack);
    assert_eq!(
        sys.kernel.syscall(SyscallNumber::IoctlFd.as_u32()),
        SyscallOutcome::Returned(EACCES)
    );
    assert_eq!(sys.context(client).return_value(), EACCES);
    assert_eq!(sys.kernel.thread_id(), client);
    assert_eq!(sys.kernel.in_flight_count(), 0);
    assert!(sys.kernel.syscall_audit().has_event(|e| matches!(
        e,
        SyscallEvent::Completed { syscall, result, .. } if syscall == "IoctlFd" && *result == EACCES
    )));
    assert_consistent(&sys.kernel);
}

#[test]
fn test_stack_arguments_outside_process_rejected() {
    let (mut sys, _) = boot();
    let client = sys.spawn(2, 50);
    // Another process's stack
    let foreign = sys.alloc(3, 16);
    stage(&mut sys, client, &[0, 0x1234, 0, 0, 0, 0], foreign);
    assert_eq!(
        sys.kernel.syscall(SyscallNumber::IoctlFd.as_u32()),
        SyscallOutcome::Returned(EACCES)
    );
    assert!(sys.kernel.syscall_audit().has_event(|e| matches!(
        e,
        SyscallEvent::Rejected { caller, result, .. } if *caller == client && *result == EACCES
    )));
}
