//! Resilience Test Utilities
//!
//! Shared helpers for the end-to-end scenarios under `tests/`.
//!
//! ## Test Philosophy
//!
//! - **Observable decisions**: scenarios assert on the audit trails and the
//!   log console, not only on return codes
//! - **Invariants after every step**: a scenario that leaves a thread linked
//!   twice or a message slot leaked fails even if every call succeeded
//! - **Real memory map**: every scenario boots [`TestSystem`], so pointer
//!   checks run against actual page tables

use core_types::{QueueId, ThreadId};
use ipc::IpcMessage;
use kernel_api::KernelApi;
use services_logger::RingLogger;
use sim_kernel::test_utils::TestSystem;
use sim_kernel::SimulatedKernel;

/// Boots a kernel with the console logger installed
pub fn boot() -> (TestSystem, &'static RingLogger) {
    let logger = RingLogger::install();
    (TestSystem::new(), logger)
}

/// Fails with the kernel's transport audit trail attached
pub fn assert_consistent(kernel: &SimulatedKernel) {
    if let Err(violation) = kernel.check_invariants() {
        let trail = serde_json::to_string(kernel.kernel_events().events())
            .unwrap_or_else(|e| format!("<unserializable: {e}>"));
        panic!("{violation}\nkernel events: {trail}");
    }
}

/// A resource manager thread parked in receive on its own queue
pub struct Server {
    pub thread: ThreadId,
    pub queue: QueueId,
    /// Word the receive writes the message address to
    pub out: u32,
}

impl Server {
    /// Registers `path` from a priority-100 thread in process `pid`
    pub fn start(sys: &mut TestSystem, pid: u32, path: &str) -> Self {
        let (thread, queue, out) = sys.serve(pid, path, 4);
        Self { thread, queue, out }
    }

    /// Takes the message handed over at the last receive
    pub fn take(&self, sys: &mut TestSystem) -> u32 {
        sys.focus(self.thread);
        sys.kernel.memory().read_u32(self.out)
    }

    /// Takes and decodes the pending message
    pub fn request(&self, sys: &mut TestSystem) -> (u32, IpcMessage) {
        let message = self.take(sys);
        let decoded = sys
            .kernel
            .read_message(message)
            .expect("message decodes");
        (message, decoded)
    }

    /// Replies, then goes back to waiting
    pub fn answer(&self, sys: &mut TestSystem, message: u32, result: i32) {
        sys.focus(self.thread);
        sys.kernel
            .resource_reply(message, result)
            .expect("reply accepted");
        // The woken caller may have taken the CPU
        sys.focus(self.thread);
        let next = sys
            .kernel
            .receive_message(self.queue, self.out, 0)
            .expect("receive");
        assert!(next.is_suspended(), "no request left behind");
    }
}
