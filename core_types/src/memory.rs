//! # Memory Protection Types
//!
//! Vocabulary shared by the page table and every component that validates
//! user pointers.
//!
//! ## Model
//!
//! - Every page-table entry is tagged with one of 16 **domains**.
//! - Every process has a **domain access control** word: 2 bits per domain
//!   selecting no access, client (permission bits apply) or manager
//!   (permission bits ignored).
//! - Every mapping carries **access permission** bits deciding what a client
//!   may do with it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of MMU domains
pub const DOMAIN_COUNT: usize = 16;

/// An MMU domain tag (0..16)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Domain(u8);

impl Domain {
    /// Domain reserved for kernel-only mappings
    pub const KERNEL: Domain = Domain(0);

    /// Creates a domain, rejecting values outside 0..16
    pub fn new(raw: u32) -> Option<Self> {
        if (raw as usize) < DOMAIN_COUNT {
            Some(Self(raw as u8))
        } else {
            None
        }
    }

    /// Decodes the 4-bit domain field of a descriptor (upper bits ignored)
    pub fn from_field(bits: u32) -> Self {
        Self((bits & 0xF) as u8)
    }

    /// Returns the raw domain number
    pub fn as_u32(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domain:{}", self.0)
    }
}

/// Access level a process holds on one domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DomainAccess {
    /// Any access faults
    NoAccess,
    /// Accesses are checked against the page permission bits
    Client,
    /// Encoding 0b10; behaves like no access
    Reserved,
    /// Accesses are never checked
    Manager,
}

impl DomainAccess {
    /// Decodes the 2-bit field
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b00 => DomainAccess::NoAccess,
            0b01 => DomainAccess::Client,
            0b10 => DomainAccess::Reserved,
            _ => DomainAccess::Manager,
        }
    }

    /// Encodes the 2-bit field
    pub fn to_bits(self) -> u32 {
        match self {
            DomainAccess::NoAccess => 0b00,
            DomainAccess::Client => 0b01,
            DomainAccess::Reserved => 0b10,
            DomainAccess::Manager => 0b11,
        }
    }

    /// Returns true for client or manager access
    pub fn is_at_least_client(self) -> bool {
        matches!(self, DomainAccess::Client | DomainAccess::Manager)
    }
}

/// A process's domain access control word (the DACR value)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DomainAccessControl(u32);

impl DomainAccessControl {
    /// No access to any domain
    pub const NONE: DomainAccessControl = DomainAccessControl(0);

    /// Manager access to every domain
    pub const ALL_MANAGER: DomainAccessControl = DomainAccessControl(u32::MAX);

    /// Wraps a raw DACR value
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns the raw DACR value
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns the access level for a domain
    pub fn access(self, domain: Domain) -> DomainAccess {
        DomainAccess::from_bits(self.0 >> (domain.as_u32() * 2))
    }

    /// Returns a copy with the access level for `domain` replaced
    pub fn with(self, domain: Domain, access: DomainAccess) -> Self {
        let shift = domain.as_u32() * 2;
        let cleared = self.0 & !(0b11 << shift);
        Self(cleared | (access.to_bits() << shift))
    }
}

/// Page access-permission (AP) bits, as seen by user-mode clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessPermission {
    /// AP=00: no user access
    None,
    /// AP=01: privileged read/write, no user access
    PrivilegedOnly,
    /// AP=10: user read-only
    ReadOnly,
    /// AP=11: user read/write
    ReadWrite,
}

impl AccessPermission {
    /// Decodes the 2-bit AP field
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b00 => AccessPermission::None,
            0b01 => AccessPermission::PrivilegedOnly,
            0b10 => AccessPermission::ReadOnly,
            _ => AccessPermission::ReadWrite,
        }
    }

    /// Encodes the 2-bit AP field
    pub fn to_bits(self) -> u32 {
        match self {
            AccessPermission::None => 0b00,
            AccessPermission::PrivilegedOnly => 0b01,
            AccessPermission::ReadOnly => 0b10,
            AccessPermission::ReadWrite => 0b11,
        }
    }

    /// Returns whether a user-mode client may perform `need`
    pub fn grants(self, need: AccessNeed) -> bool {
        match need {
            AccessNeed::Read => matches!(self, AccessPermission::ReadOnly | AccessPermission::ReadWrite),
            AccessNeed::Write => self == AccessPermission::ReadWrite,
        }
    }
}

/// What a single process must be able to do with a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessNeed {
    Read,
    Write,
}

/// Direction of a cross-process buffer check
///
/// The check involves two processes: the caller that supplied the buffer and
/// the owner of the resource manager that will touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessKind {
    /// Both sides read the buffer (request payloads)
    Read,
    /// Both sides write the buffer
    Write,
    /// Output buffer: the caller reads it back, the owner writes it
    OwnerWrite,
}

impl AccessKind {
    /// Decodes the syscall-level access code (1 = read, 2 = write, 3 = owner-write)
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(AccessKind::Read),
            2 => Some(AccessKind::Write),
            3 => Some(AccessKind::OwnerWrite),
            _ => None,
        }
    }

    /// What the calling process needs
    pub fn caller_need(self) -> AccessNeed {
        match self {
            AccessKind::Read | AccessKind::OwnerWrite => AccessNeed::Read,
            AccessKind::Write => AccessNeed::Write,
        }
    }

    /// What the owning process needs
    pub fn owner_need(self) -> AccessNeed {
        match self {
            AccessKind::Read => AccessNeed::Read,
            AccessKind::Write | AccessKind::OwnerWrite => AccessNeed::Write,
        }
    }
}
