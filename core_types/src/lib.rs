//! # Core Types
//!
//! This crate defines the fundamental types shared by every layer of the
//! Starling kernel.
//!
//! ## Philosophy
//!
//! - **Tables, not pointers**: kernel objects are addressed by slot index.
//! - **Typed ids**: a queue id cannot be passed where a thread id is expected.
//! - **Protection is vocabulary**: domains and permissions are named types,
//!   not bit masks scattered through the code.
//!
//! ## Key Types
//!
//! - [`ProcessId`], [`ThreadId`]: who is running
//! - [`QueueId`], [`Fd`], [`TimerId`], [`HeapId`], [`ResourceManagerId`]: kernel objects
//! - [`Domain`], [`DomainAccessControl`], [`AccessPermission`], [`AccessKind`]: memory protection

pub mod ids;
pub mod memory;

pub use ids::{
    Fd, HeapId, ProcessId, QueueId, ResourceManagerId, ThreadId, TimerId, MAX_PROCESSES,
};
pub use memory::{
    AccessKind, AccessNeed, AccessPermission, Domain, DomainAccess, DomainAccessControl,
    DOMAIN_COUNT,
};
