//! Resource-manager registry
//!
//! Maps device paths to the message queue that serves them. Opens are
//! routed to the longest registered path that prefixes the requested one.

use crate::SimulatedKernel;
use core_types::{ProcessId, QueueId, ResourceManagerId};
use kernel_api::KernelError;
use log::info;
use serde::{Deserialize, Serialize};

/// A registered device path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceManager {
    pub path: String,
    pub queue: QueueId,
    pub owner: ProcessId,
    /// Whether the external processor may open this device
    pub external_access: bool,
}

/// Fixed-size table of resource managers
#[derive(Debug)]
pub struct ResourceRegistry {
    entries: Vec<Option<ResourceManager>>,
}

impl ResourceRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![None; capacity],
        }
    }

    pub fn register(
        &mut self,
        path: &str,
        queue: QueueId,
        owner: ProcessId,
    ) -> Result<ResourceManagerId, KernelError> {
        if self.iter().any(|(_, rm)| rm.path == path) {
            return Err(KernelError::AlreadyExists("path already registered"));
        }
        let slot = self
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::Exhausted("resource manager table"))?;
        self.entries[slot] = Some(ResourceManager {
            path: path.to_string(),
            queue,
            owner,
            external_access: true,
        });
        Ok(ResourceManagerId::from_index(slot))
    }

    pub fn get(&self, id: ResourceManagerId) -> Option<&ResourceManager> {
        self.entries.get(id.index()).and_then(Option::as_ref)
    }

    /// Longest registered path that is a prefix of `path`
    pub fn lookup(&self, path: &str) -> Option<(ResourceManagerId, &ResourceManager)> {
        self.iter()
            .filter(|(_, rm)| path.starts_with(rm.path.as_str()))
            .max_by_key(|(_, rm)| rm.path.len())
    }

    /// Drops every registration served by `queue`; returns how many
    pub fn remove_bound_to(&mut self, queue: QueueId) -> usize {
        let mut removed = 0;
        for entry in self.entries.iter_mut() {
            if entry.as_ref().is_some_and(|rm| rm.queue == queue) {
                *entry = None;
                removed += 1;
            }
        }
        removed
    }

    pub fn set_external_access(&mut self, path: &str, allowed: bool) -> Result<(), KernelError> {
        let rm = self
            .entries
            .iter_mut()
            .flatten()
            .find(|rm| rm.path == path)
            .ok_or(KernelError::NotFound("path not registered"))?;
        rm.external_access = allowed;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceManagerId, &ResourceManager)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|rm| (ResourceManagerId::from_index(i), rm)))
    }
}

impl SimulatedKernel {
    pub(crate) fn sys_register_resource_manager(
        &mut self,
        path: u32,
        queue: QueueId,
    ) -> Result<ResourceManagerId, KernelError> {
        self.caller()?;
        let process = self.caller_process();
        let name = self.read_user_path(process, process, path)?;
        self.check_queue_access(queue, process)?;
        let owner = self.queue_ref(queue)?.owner;
        let id = self.registry.register(&name, queue, owner)?;
        info!("{} serves {} on {}", owner, name, queue);
        Ok(id)
    }

    /// Shows or hides a device from the external processor
    ///
    /// Only the kernel may change it.
    pub fn set_external_access(&mut self, path: &str, allowed: bool) -> Result<(), KernelError> {
        if !self.caller_process().is_kernel() {
            return Err(KernelError::AccessDenied("only the kernel sets device visibility"));
        }
        self.registry.set_external_access(path, allowed)
    }

    pub fn resource_managers(&self) -> &ResourceRegistry {
        &self.registry
    }
}
