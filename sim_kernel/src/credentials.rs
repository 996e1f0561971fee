//! Per-process user and group ids
//!
//! The kernel does not interpret them. They are stamped into every Open
//! request so resource managers can make their own access decisions.

use crate::SimulatedKernel;
use core_types::ProcessId;
use kernel_api::KernelError;
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u16,
}

impl SimulatedKernel {
    fn check_credential_setter(&self) -> Result<(), KernelError> {
        if self.caller_process().is_kernel() {
            Ok(())
        } else {
            Err(KernelError::AccessDenied("only the kernel sets credentials"))
        }
    }

    pub(crate) fn sys_uid(&self) -> u32 {
        self.credentials[self.caller_process().index()].uid
    }

    pub(crate) fn sys_gid(&self) -> u16 {
        self.credentials[self.caller_process().index()].gid
    }

    pub(crate) fn sys_set_uid(&mut self, process: ProcessId, uid: u32) -> Result<(), KernelError> {
        self.check_credential_setter()?;
        self.credentials[process.index()].uid = uid;
        info!("{} uid {:#x}", process, uid);
        Ok(())
    }

    pub(crate) fn sys_set_gid(&mut self, process: ProcessId, gid: u16) -> Result<(), KernelError> {
        self.check_credential_setter()?;
        self.credentials[process.index()].gid = gid;
        info!("{} gid {:#x}", process, gid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::TestSystem;
    use kernel_api::{KernelApi, EACCES};

    #[test]
    fn test_setters_are_kernel_only() {
        let mut sys = TestSystem::new();
        sys.kernel.set_uid(sys.pid(3), 0x1000).unwrap();
        sys.kernel.set_gid(sys.pid(3), 0x0001).unwrap();

        let user = sys.spawn(3, 50);
        sys.focus(user);
        assert_eq!(sys.kernel.uid(), 0x1000);
        assert_eq!(sys.kernel.gid(), 0x0001);
        assert_eq!(sys.kernel.set_uid(sys.pid(3), 0).unwrap_err().code(), EACCES);
        assert_eq!(sys.kernel.set_gid(sys.pid(4), 0).unwrap_err().code(), EACCES);
    }

    #[test]
    fn test_kernel_defaults_to_root() {
        let sys = TestSystem::new();
        assert_eq!(sys.kernel.uid(), 0);
        assert_eq!(sys.kernel.gid(), 0);
    }
}
