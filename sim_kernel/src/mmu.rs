//! # Memory Protection
//!
//! The shared two-level translation table, per-process domain access, and
//! the pointer predicate every IPC buffer must pass.
//!
//! ## Translation table
//!
//! - 4096 first-level entries, one per MiB: fault, a 1 MiB section, or a
//!   pointer to a 256-entry course-page table
//! - course-page tables cover one MiB in 4 KiB pages and inherit the
//!   domain of their first-level entry
//! - first-level slot 0xD0 (the hardware-register alias page) is repointed
//!   per process on every context switch
//!
//! Entries are modelled as enums; [`FirstLevelEntry::to_bits`] and
//! [`SmallPageEntry::to_bits`] produce the ARMv5 descriptor words.

use crate::audit::AuditLog;
use crate::layout::{COARSE_POOL_BASE, PAGE_SIZE, SECTION_SIZE};
use core_types::{
    AccessKind, AccessNeed, AccessPermission, Domain, DomainAccess, DomainAccessControl,
    ProcessId, MAX_PROCESSES,
};
use hal::CriticalSection;
use kernel_api::KernelError;
use log::debug;
use serde::{Deserialize, Serialize};

/// First-level entries (one per MiB)
pub const FIRST_LEVEL_ENTRIES: usize = 4096;

/// Entries in a course-page table
pub const COARSE_ENTRIES: usize = 256;

/// Bytes occupied by one course-page table
pub const COARSE_TABLE_SIZE: u32 = 0x400;

/// First-level slot of the hardware-register alias page
pub const HARDWARE_VIEW_INDEX: usize = 0xD0;

/// Descriptor bit fields
pub mod descriptor {
    pub const TYPE_MASK: u32 = 0b11;
    pub const TYPE_COARSE: u32 = 0b01;
    pub const TYPE_SECTION: u32 = 0b10;
    pub const TYPE_SMALL_PAGE: u32 = 0b10;
    pub const BUFFERABLE: u32 = 1 << 2;
    pub const CACHEABLE: u32 = 1 << 3;
    pub const FIRST_LEVEL_BIT4: u32 = 1 << 4;
    pub const DOMAIN_SHIFT: u32 = 5;
    pub const SECTION_AP_SHIFT: u32 = 10;
    pub const SMALL_PAGE_AP_SHIFT: u32 = 4;
    pub const SECTION_BASE_MASK: u32 = 0xFFF0_0000;
    pub const COARSE_BASE_MASK: u32 = 0xFFFF_FC00;
    pub const SMALL_PAGE_BASE_MASK: u32 = 0xFFFF_F000;
}

fn cache_bits(cached: bool) -> u32 {
    if cached {
        descriptor::CACHEABLE | descriptor::BUFFERABLE
    } else {
        0
    }
}

/// A first-level descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirstLevelEntry {
    Fault,
    Section {
        base: u32,
        domain: Domain,
        access: AccessPermission,
        cached: bool,
    },
    CoarseTable {
        table: u32,
        domain: Domain,
    },
}

impl FirstLevelEntry {
    /// Encodes the descriptor word
    pub fn to_bits(self) -> u32 {
        match self {
            FirstLevelEntry::Fault => 0,
            FirstLevelEntry::Section {
                base,
                domain,
                access,
                cached,
            } => {
                (base & descriptor::SECTION_BASE_MASK)
                    | (access.to_bits() << descriptor::SECTION_AP_SHIFT)
                    | (domain.as_u32() << descriptor::DOMAIN_SHIFT)
                    | descriptor::FIRST_LEVEL_BIT4
                    | cache_bits(cached)
                    | descriptor::TYPE_SECTION
            }
            FirstLevelEntry::CoarseTable { table, domain } => {
                (table & descriptor::COARSE_BASE_MASK)
                    | (domain.as_u32() << descriptor::DOMAIN_SHIFT)
                    | descriptor::FIRST_LEVEL_BIT4
                    | descriptor::TYPE_COARSE
            }
        }
    }

    /// Decodes a descriptor word; fine tables decode as faults
    pub fn from_bits(bits: u32) -> Self {
        let domain = Domain::from_field(bits >> descriptor::DOMAIN_SHIFT);
        match bits & descriptor::TYPE_MASK {
            descriptor::TYPE_SECTION => FirstLevelEntry::Section {
                base: bits & descriptor::SECTION_BASE_MASK,
                domain,
                access: AccessPermission::from_bits(bits >> descriptor::SECTION_AP_SHIFT),
                cached: bits & descriptor::CACHEABLE != 0,
            },
            descriptor::TYPE_COARSE => FirstLevelEntry::CoarseTable {
                table: bits & descriptor::COARSE_BASE_MASK,
                domain,
            },
            _ => FirstLevelEntry::Fault,
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, FirstLevelEntry::Fault)
    }
}

/// A second-level (course-page table) descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmallPageEntry {
    Fault,
    Page {
        base: u32,
        access: AccessPermission,
        cached: bool,
    },
}

impl SmallPageEntry {
    /// Encodes the descriptor word; all four sub-page AP fields carry the same value
    pub fn to_bits(self) -> u32 {
        match self {
            SmallPageEntry::Fault => 0,
            SmallPageEntry::Page {
                base,
                access,
                cached,
            } => {
                let ap = access.to_bits();
                let ap_all = ap | (ap << 2) | (ap << 4) | (ap << 6);
                (base & descriptor::SMALL_PAGE_BASE_MASK)
                    | (ap_all << descriptor::SMALL_PAGE_AP_SHIFT)
                    | cache_bits(cached)
                    | descriptor::TYPE_SMALL_PAGE
            }
        }
    }

    /// Decodes a descriptor word; the first sub-page AP field is authoritative
    pub fn from_bits(bits: u32) -> Self {
        if bits & descriptor::TYPE_MASK == descriptor::TYPE_SMALL_PAGE {
            SmallPageEntry::Page {
                base: bits & descriptor::SMALL_PAGE_BASE_MASK,
                access: AccessPermission::from_bits(bits >> descriptor::SMALL_PAGE_AP_SHIFT),
                cached: bits & descriptor::CACHEABLE != 0,
            }
        } else {
            SmallPageEntry::Fault
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, SmallPageEntry::Fault)
    }
}

/// A physical/virtual range with its protection attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySection {
    pub physical: u32,
    pub virtual_address: u32,
    pub size: u32,
    pub domain: Domain,
    pub access: AccessPermission,
    pub cached: bool,
}

impl MemorySection {
    /// An identity-mapped, cached section
    pub fn identity(address: u32, size: u32, domain: Domain, access: AccessPermission) -> Self {
        Self {
            physical: address,
            virtual_address: address,
            size,
            domain,
            access,
            cached: true,
        }
    }

    fn end(&self) -> u64 {
        self.virtual_address as u64 + self.size as u64
    }

    fn aligned_to(&self, alignment: u32) -> bool {
        self.physical % alignment == 0
            && self.virtual_address % alignment == 0
            && self.size % alignment == 0
    }

    fn validate(&self, alignment: u32) -> Result<(), KernelError> {
        if self.size == 0 || !self.aligned_to(alignment) {
            return Err(KernelError::InvalidArgument("misaligned mapping"));
        }
        if self.end() > 1u64 << 32 || self.physical as u64 + self.size as u64 > 1u64 << 32 {
            return Err(KernelError::InvalidArgument("mapping wraps the address space"));
        }
        Ok(())
    }

    fn slice(&self, offset: u32, size: u32) -> Self {
        Self {
            physical: self.physical + offset,
            virtual_address: self.virtual_address + offset,
            size,
            ..*self
        }
    }
}

/// What a map call does to slots that are already populated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapMode {
    /// Populated slots are an error
    Fresh,
    /// Populated slots are overwritten
    Replace,
}

impl MapMode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(MapMode::Fresh),
            1 => Some(MapMode::Replace),
            _ => None,
        }
    }
}

/// Mapping granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Granularity {
    Section,
    CoursePage,
}

/// Memory-protection audit events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessEvent {
    /// A pointer check ran
    Checked {
        ptr: u32,
        size: u32,
        kind: AccessKind,
        caller: ProcessId,
        owner: ProcessId,
        allowed: bool,
        /// First address of the block that failed, if any
        failed_at: Option<u32>,
    },
    /// Entries were installed
    Mapped {
        virtual_address: u32,
        size: u32,
        granularity: Granularity,
    },
    /// A process's view became active (context switch)
    Activated { process: ProcessId },
    /// A process's domain access word changed
    DomainAccessChanged {
        process: ProcessId,
        dacr: DomainAccessControl,
    },
}

/// The block covering one address, as seen by one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub physical: u32,
    pub domain: Domain,
    pub access: AccessPermission,
    /// First address past the covering block
    pub block_end: u64,
}

/// The translation table and domain tables
#[derive(Debug)]
pub struct Mmu {
    first_level: Vec<FirstLevelEntry>,
    coarse_tables: Vec<Vec<SmallPageEntry>>,
    coarse_capacity: usize,
    domain_access: [DomainAccessControl; MAX_PROCESSES],
    hardware_views: [Option<FirstLevelEntry>; MAX_PROCESSES],
    active: ProcessId,
    audit: AuditLog<AccessEvent>,
}

impl Mmu {
    /// Creates an empty table; only the kernel has domain access
    pub fn new(coarse_capacity: usize) -> Self {
        let mut domain_access = [DomainAccessControl::NONE; MAX_PROCESSES];
        domain_access[ProcessId::KERNEL.index()] = DomainAccessControl::ALL_MANAGER;
        Self {
            first_level: vec![FirstLevelEntry::Fault; FIRST_LEVEL_ENTRIES],
            coarse_tables: Vec::new(),
            coarse_capacity,
            domain_access,
            hardware_views: [None; MAX_PROCESSES],
            active: ProcessId::KERNEL,
            audit: AuditLog::new(),
        }
    }

    /// Returns the memory-protection audit log
    pub fn audit(&self) -> &AuditLog<AccessEvent> {
        &self.audit
    }

    pub fn audit_mut(&mut self) -> &mut AuditLog<AccessEvent> {
        &mut self.audit
    }

    /// Process whose view is installed
    pub fn active_process(&self) -> ProcessId {
        self.active
    }

    /// The DACR value currently loaded
    pub fn active_domain_access(&self) -> DomainAccessControl {
        self.domain_access[self.active.index()]
    }

    pub fn domain_access(&self, process: ProcessId) -> DomainAccessControl {
        self.domain_access[process.index()]
    }

    pub fn set_domain_access(
        &mut self,
        _cs: &CriticalSection,
        process: ProcessId,
        dacr: DomainAccessControl,
    ) {
        self.domain_access[process.index()] = dacr;
        self.audit
            .record(AccessEvent::DomainAccessChanged { process, dacr });
    }

    /// Gives a process its own hardware-register alias page (or the shared one with `None`)
    pub fn set_hardware_view(
        &mut self,
        _cs: &CriticalSection,
        process: ProcessId,
        view: Option<FirstLevelEntry>,
    ) {
        self.hardware_views[process.index()] = view;
    }

    /// Installs a process's domain access and hardware view
    pub fn activate(&mut self, _cs: &CriticalSection, process: ProcessId) {
        self.active = process;
        self.audit.record(AccessEvent::Activated { process });
    }

    /// Number of course-page tables in use
    pub fn coarse_tables_used(&self) -> usize {
        self.coarse_tables.len()
    }

    /// The first-level entry a process sees at `index`
    pub fn entry_for(&self, process: ProcessId, index: usize) -> FirstLevelEntry {
        if index == HARDWARE_VIEW_INDEX {
            if let Some(view) = self.hardware_views[process.index()] {
                return view;
            }
        }
        self.first_level[index]
    }

    /// Descriptor word the hardware walks at `index` for the active process
    pub fn first_level_bits(&self, index: usize) -> u32 {
        self.entry_for(self.active, index).to_bits()
    }

    /// Descriptor word at `slot` of the course-page table at `table`
    pub fn coarse_bits(&self, table: u32, slot: usize) -> Option<u32> {
        let entries = self.coarse_tables.get(Self::coarse_index(table)?)?;
        entries.get(slot).map(|entry| entry.to_bits())
    }

    fn coarse_index(table: u32) -> Option<usize> {
        let offset = table.checked_sub(COARSE_POOL_BASE)?;
        if offset % COARSE_TABLE_SIZE != 0 {
            return None;
        }
        Some((offset / COARSE_TABLE_SIZE) as usize)
    }

    /// Resolves the block covering `addr` in the view of `process`
    pub fn resolve(&self, process: ProcessId, addr: u32) -> Option<Resolved> {
        let index = (addr / SECTION_SIZE) as usize;
        match self.entry_for(process, index) {
            FirstLevelEntry::Fault => None,
            FirstLevelEntry::Section {
                base,
                domain,
                access,
                ..
            } => Some(Resolved {
                physical: base | (addr % SECTION_SIZE),
                domain,
                access,
                block_end: (index as u64 + 1) * SECTION_SIZE as u64,
            }),
            FirstLevelEntry::CoarseTable { table, domain } => {
                let entries = self.coarse_tables.get(Self::coarse_index(table)?)?;
                let slot = ((addr % SECTION_SIZE) / PAGE_SIZE) as usize;
                match entries[slot] {
                    SmallPageEntry::Fault => None,
                    SmallPageEntry::Page { base, access, .. } => Some(Resolved {
                        physical: base | (addr % PAGE_SIZE),
                        domain,
                        access,
                        block_end: (addr - addr % PAGE_SIZE) as u64 + PAGE_SIZE as u64,
                    }),
                }
            }
        }
    }

    /// Translates a virtual address through the active process's view
    pub fn translate(&self, addr: u32) -> Option<u32> {
        self.resolve(self.active, addr).map(|resolved| resolved.physical)
    }

    /// Checks that both processes may touch `[ptr, ptr + size)` as `kind` requires
    ///
    /// The range is walked one block at a time. For every block each side
    /// other than the kernel needs client or manager access to the block's
    /// domain, and client access additionally needs permission bits that
    /// grant that side's need. A single failing block rejects the range.
    pub fn check_memory_pointer(
        &mut self,
        ptr: u32,
        size: u32,
        kind: AccessKind,
        caller: ProcessId,
        owner: ProcessId,
    ) -> Result<(), KernelError> {
        let failed_at = self.walk(ptr, size, kind, caller, owner).err();
        let allowed = failed_at.is_none();
        self.audit.record(AccessEvent::Checked {
            ptr,
            size,
            kind,
            caller,
            owner,
            allowed,
            failed_at,
        });
        if allowed {
            Ok(())
        } else {
            debug!(
                "pointer check failed: {:#010x}+{:#x} {:?} {} {}",
                ptr, size, kind, caller, owner
            );
            Err(KernelError::AccessDenied("buffer fails the pointer check"))
        }
    }

    fn walk(
        &self,
        ptr: u32,
        size: u32,
        kind: AccessKind,
        caller: ProcessId,
        owner: ProcessId,
    ) -> Result<(), u32> {
        if size == 0 {
            return Ok(());
        }
        let end = ptr as u64 + size as u64;
        if end > 1u64 << 32 {
            return Err(ptr);
        }
        if caller.is_kernel() && owner.is_kernel() {
            return Ok(());
        }

        let sides = [(caller, kind.caller_need()), (owner, kind.owner_need())];
        let mut addr = ptr as u64;
        while addr < end {
            let mut block_end = end;
            for &(process, need) in sides.iter().filter(|(p, _)| !p.is_kernel()) {
                let block = addr as u32;
                let resolved = self.resolve(process, block).ok_or(block)?;
                if !self.permits(process, &resolved, need) {
                    return Err(block);
                }
                block_end = block_end.min(resolved.block_end);
            }
            addr = block_end;
        }
        Ok(())
    }

    fn permits(&self, process: ProcessId, resolved: &Resolved, need: AccessNeed) -> bool {
        match self.domain_access[process.index()].access(resolved.domain) {
            DomainAccess::Manager => true,
            DomainAccess::Client => resolved.access.grants(need),
            DomainAccess::NoAccess | DomainAccess::Reserved => false,
        }
    }

    /// Maps a range, using sections where naturally aligned and course pages elsewhere
    pub fn map_memory(
        &mut self,
        cs: &CriticalSection,
        section: MemorySection,
        mode: MapMode,
    ) -> Result<(), KernelError> {
        section.validate(PAGE_SIZE)?;

        let mut plan = Vec::new();
        let mut offset = 0;
        while offset < section.size {
            let piece = section.slice(offset, section.size - offset);
            let remaining = piece.size;
            let chunk = if piece.aligned_to(SECTION_SIZE) || (
                piece.virtual_address % SECTION_SIZE == 0
                    && piece.physical % SECTION_SIZE == 0
                    && remaining >= SECTION_SIZE
            ) {
                (Granularity::Section, remaining - remaining % SECTION_SIZE)
            } else {
                let to_boundary = SECTION_SIZE - piece.virtual_address % SECTION_SIZE;
                (Granularity::CoursePage, remaining.min(to_boundary))
            };
            plan.push((chunk.0, section.slice(offset, chunk.1)));
            offset += chunk.1;
        }

        let mut new_tables = 0;
        for (granularity, chunk) in &plan {
            match granularity {
                Granularity::Section => self.plan_sections(chunk, mode)?,
                Granularity::CoursePage => new_tables += self.plan_course_pages(chunk, mode)?,
            }
        }
        if self.coarse_tables.len() + new_tables > self.coarse_capacity {
            return Err(KernelError::Exhausted("course-page table pool"));
        }

        for (granularity, chunk) in plan {
            match granularity {
                Granularity::Section => self.install_sections(cs, &chunk),
                Granularity::CoursePage => self.install_course_pages(cs, &chunk),
            }
        }
        Ok(())
    }

    /// Maps a range as 1 MiB sections, overwriting whatever was there
    pub fn map_memory_as_section(
        &mut self,
        cs: &CriticalSection,
        section: MemorySection,
    ) -> Result<(), KernelError> {
        section.validate(SECTION_SIZE)?;
        self.install_sections(cs, &section);
        Ok(())
    }

    /// Maps a range as 4 KiB course pages
    ///
    /// Second-level tables are allocated on demand. A page inside a MiB
    /// already mapped as a section, or under a table of another domain, is
    /// rejected, as is a populated page slot under `MapMode::Fresh`.
    pub fn map_memory_as_course_page(
        &mut self,
        cs: &CriticalSection,
        section: MemorySection,
        mode: MapMode,
    ) -> Result<(), KernelError> {
        section.validate(PAGE_SIZE)?;
        let new_tables = self.plan_course_pages(&section, mode)?;
        if self.coarse_tables.len() + new_tables > self.coarse_capacity {
            return Err(KernelError::Exhausted("course-page table pool"));
        }
        self.install_course_pages(cs, &section);
        Ok(())
    }

    fn plan_sections(&self, section: &MemorySection, mode: MapMode) -> Result<(), KernelError> {
        if mode == MapMode::Fresh {
            let first = (section.virtual_address / SECTION_SIZE) as usize;
            let count = (section.size / SECTION_SIZE) as usize;
            if self.first_level[first..first + count]
                .iter()
                .any(|entry| !entry.is_fault())
            {
                return Err(KernelError::InvalidArgument("section slot already mapped"));
            }
        }
        Ok(())
    }

    /// Validates a course-page mapping; returns how many tables it needs
    fn plan_course_pages(
        &self,
        section: &MemorySection,
        mode: MapMode,
    ) -> Result<usize, KernelError> {
        let mut new_tables = 0;
        let mut last_index = None;
        let mut page = section.virtual_address as u64;
        while page < section.end() {
            let addr = page as u32;
            let index = (addr / SECTION_SIZE) as usize;
            match self.first_level[index] {
                FirstLevelEntry::Fault => {
                    if last_index != Some(index) {
                        new_tables += 1;
                    }
                }
                FirstLevelEntry::Section { .. } => {
                    return Err(KernelError::InvalidArgument("MiB already mapped as a section"));
                }
                FirstLevelEntry::CoarseTable { table, domain } => {
                    if domain != section.domain {
                        return Err(KernelError::InvalidArgument("course table has another domain"));
                    }
                    let slot = ((addr % SECTION_SIZE) / PAGE_SIZE) as usize;
                    let populated = Self::coarse_index(table)
                        .and_then(|t| self.coarse_tables.get(t))
                        .is_some_and(|entries| !entries[slot].is_fault());
                    if populated && mode == MapMode::Fresh {
                        return Err(KernelError::InvalidArgument("course page already mapped"));
                    }
                }
            }
            last_index = Some(index);
            page += PAGE_SIZE as u64;
        }
        Ok(new_tables)
    }

    fn install_sections(&mut self, _cs: &CriticalSection, section: &MemorySection) {
        let first = (section.virtual_address / SECTION_SIZE) as usize;
        for i in 0..(section.size / SECTION_SIZE) {
            self.first_level[first + i as usize] = FirstLevelEntry::Section {
                base: section.physical + i * SECTION_SIZE,
                domain: section.domain,
                access: section.access,
                cached: section.cached,
            };
        }
        self.audit.record(AccessEvent::Mapped {
            virtual_address: section.virtual_address,
            size: section.size,
            granularity: Granularity::Section,
        });
    }

    /// Installs pages validated by `plan_course_pages`
    fn install_course_pages(&mut self, _cs: &CriticalSection, section: &MemorySection) {
        let mut offset = 0;
        while offset < section.size {
            let addr = section.virtual_address + offset;
            let index = (addr / SECTION_SIZE) as usize;
            let table = match self.first_level[index] {
                FirstLevelEntry::CoarseTable { table, .. } => table,
                _ => {
                    let table =
                        COARSE_POOL_BASE + self.coarse_tables.len() as u32 * COARSE_TABLE_SIZE;
                    self.coarse_tables
                        .push(vec![SmallPageEntry::Fault; COARSE_ENTRIES]);
                    self.first_level[index] = FirstLevelEntry::CoarseTable {
                        table,
                        domain: section.domain,
                    };
                    table
                }
            };
            if let Some(entries) =
                Self::coarse_index(table).and_then(|t| self.coarse_tables.get_mut(t))
            {
                entries[((addr % SECTION_SIZE) / PAGE_SIZE) as usize] = SmallPageEntry::Page {
                    base: section.physical + offset,
                    access: section.access,
                    cached: section.cached,
                };
            }
            offset += PAGE_SIZE;
        }
        self.audit.record(AccessEvent::Mapped {
            virtual_address: section.virtual_address,
            size: section.size,
            granularity: Granularity::CoursePage,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupts::SimInterruptController;
    use hal::SharedInterrupts;
    use std::sync::Arc;

    const SHARED: u32 = 1;
    const PRIVATE_A: u32 = 2;
    const PRIVATE_B: u32 = 3;

    fn domain(raw: u32) -> Domain {
        Domain::new(raw).unwrap()
    }

    fn pid(raw: u32) -> ProcessId {
        ProcessId::new(raw).unwrap()
    }

    fn irq() -> SharedInterrupts {
        Arc::new(SimInterruptController::new())
    }

    /// pid 1 is a client of SHARED and PRIVATE_A, pid 2 of SHARED and PRIVATE_B
    fn setup() -> (Mmu, SharedInterrupts) {
        let irq = irq();
        let mut mmu = Mmu::new(4);
        {
            let cs = CriticalSection::enter(&irq);
            mmu.map_memory_as_section(
                &cs,
                MemorySection::identity(0x1000_0000, 0x20_0000, domain(SHARED), AccessPermission::ReadWrite),
            )
            .unwrap();
            mmu.map_memory_as_section(
                &cs,
                MemorySection::identity(0x1020_0000, SECTION_SIZE, domain(SHARED), AccessPermission::ReadOnly),
            )
            .unwrap();
            mmu.map_memory_as_section(
                &cs,
                MemorySection::identity(0x1100_0000, SECTION_SIZE, domain(PRIVATE_A), AccessPermission::ReadWrite),
            )
            .unwrap();
            mmu.map_memory_as_section(
                &cs,
                MemorySection::identity(0x1200_0000, SECTION_SIZE, domain(PRIVATE_B), AccessPermission::ReadWrite),
            )
            .unwrap();

            let client = DomainAccessControl::NONE.with(domain(SHARED), DomainAccess::Client);
            mmu.set_domain_access(&cs, pid(1), client.with(domain(PRIVATE_A), DomainAccess::Client));
            mmu.set_domain_access(&cs, pid(2), client.with(domain(PRIVATE_B), DomainAccess::Client));
        }
        (mmu, irq)
    }

    #[test]
    fn test_section_descriptor_layout() {
        let entry = FirstLevelEntry::Section {
            base: 0x1230_0000,
            domain: domain(5),
            access: AccessPermission::ReadWrite,
            cached: true,
        };
        let bits = entry.to_bits();
        assert_eq!(bits, 0x1230_0000 | (0b11 << 10) | (5 << 5) | (1 << 4) | 0b1100 | 0b10);
        assert_eq!(FirstLevelEntry::from_bits(bits), entry);
    }

    #[test]
    fn test_coarse_and_small_page_layout() {
        let coarse = FirstLevelEntry::CoarseTable {
            table: COARSE_POOL_BASE + 0x400,
            domain: domain(2),
        };
        assert_eq!(coarse.to_bits(), (COARSE_POOL_BASE + 0x400) | (2 << 5) | (1 << 4) | 0b01);
        assert_eq!(FirstLevelEntry::from_bits(coarse.to_bits()), coarse);

        let page = SmallPageEntry::Page {
            base: 0x1000_3000,
            access: AccessPermission::ReadOnly,
            cached: false,
        };
        assert_eq!(page.to_bits(), 0x1000_3000 | (0xAA << 4) | 0b10);
        assert_eq!(SmallPageEntry::from_bits(page.to_bits()), page);
        assert_eq!(FirstLevelEntry::from_bits(0b11), FirstLevelEntry::Fault);
    }

    #[test]
    fn test_shared_buffer_passes_for_both_clients() {
        let (mut mmu, _irq) = setup();
        assert!(mmu
            .check_memory_pointer(0x1000_0100, 0x100, AccessKind::Write, pid(1), pid(2))
            .is_ok());
    }

    #[test]
    fn test_private_buffer_rejected_for_other_process() {
        let (mut mmu, _irq) = setup();
        assert!(mmu
            .check_memory_pointer(0x1100_0000, 0x10, AccessKind::Read, pid(1), pid(1))
            .is_ok());
        assert!(mmu
            .check_memory_pointer(0x1100_0000, 0x10, AccessKind::Read, pid(1), pid(2))
            .is_err());
    }

    #[test]
    fn test_single_byte_in_foreign_block_rejects_range() {
        let (mut mmu, _irq) = setup();
        // Last byte of the shared read-write MiB plus one byte of the read-only MiB
        let result = mmu.check_memory_pointer(0x101F_FFFF, 2, AccessKind::Write, pid(1), pid(2));
        assert!(result.is_err());
        assert!(mmu.audit().has_event(|e| matches!(
            e,
            AccessEvent::Checked { allowed: false, failed_at: Some(0x1020_0000), .. }
        )));
    }

    #[test]
    fn test_owner_write_splits_direction() {
        let (mut mmu, _irq) = setup();
        // Read-only block: the caller may read, the owner may not write
        assert!(mmu
            .check_memory_pointer(0x1020_0000, 4, AccessKind::Read, pid(1), pid(2))
            .is_ok());
        assert!(mmu
            .check_memory_pointer(0x1020_0000, 4, AccessKind::OwnerWrite, pid(1), pid(2))
            .is_err());
    }

    #[test]
    fn test_kernel_is_exempt() {
        let (mut mmu, _irq) = setup();
        assert!(mmu
            .check_memory_pointer(0x1200_0000, 8, AccessKind::Write, ProcessId::KERNEL, pid(2))
            .is_ok());
        assert!(mmu
            .check_memory_pointer(0xF000_0000, 8, AccessKind::Write, ProcessId::KERNEL, ProcessId::KERNEL)
            .is_ok());
    }

    #[test]
    fn test_zero_size_and_overflow() {
        let (mut mmu, _irq) = setup();
        assert!(mmu
            .check_memory_pointer(0xF000_0000, 0, AccessKind::Read, pid(1), pid(2))
            .is_ok());
        assert!(mmu
            .check_memory_pointer(0xFFFF_FFF0, 0x20, AccessKind::Read, pid(1), pid(1))
            .is_err());
    }

    #[test]
    fn test_manager_bypasses_permission_bits() {
        let (mut mmu, irq) = setup();
        {
            let cs = CriticalSection::enter(&irq);
            let dacr = mmu.domain_access(pid(1)).with(domain(SHARED), DomainAccess::Manager);
            mmu.set_domain_access(&cs, pid(1), dacr);
        }
        assert!(mmu
            .check_memory_pointer(0x1020_0000, 4, AccessKind::Write, pid(1), pid(1))
            .is_ok());
    }

    #[test]
    fn test_course_pages_demand_allocate_and_walk_per_page() {
        let (mut mmu, irq) = setup();
        {
            let cs = CriticalSection::enter(&irq);
            mmu.map_memory_as_course_page(
                &cs,
                MemorySection::identity(0x1300_0000, 0x2000, domain(SHARED), AccessPermission::ReadWrite),
                MapMode::Fresh,
            )
            .unwrap();
            mmu.map_memory_as_course_page(
                &cs,
                MemorySection::identity(0x1300_2000, 0x1000, domain(SHARED), AccessPermission::ReadOnly),
                MapMode::Fresh,
            )
            .unwrap();
        }
        assert_eq!(mmu.coarse_tables_used(), 1);
        assert_eq!(mmu.translate(0x1300_1234), Some(0x1300_1234));
        assert!(mmu
            .check_memory_pointer(0x1300_0000, 0x2000, AccessKind::Write, pid(1), pid(2))
            .is_ok());
        assert!(mmu
            .check_memory_pointer(0x1300_1FFC, 8, AccessKind::Write, pid(1), pid(2))
            .is_err());
        // Unmapped page after the table's populated slots
        assert!(mmu
            .check_memory_pointer(0x1300_3000, 4, AccessKind::Read, pid(1), pid(2))
            .is_err());
    }

    #[test]
    fn test_fresh_remap_of_course_page_rejected() {
        let (mut mmu, irq) = setup();
        let cs = CriticalSection::enter(&irq);
        let page = MemorySection::identity(0x1300_0000, 0x1000, domain(SHARED), AccessPermission::ReadWrite);
        mmu.map_memory_as_course_page(&cs, page, MapMode::Fresh).unwrap();

        let err = mmu.map_memory_as_course_page(&cs, page, MapMode::Fresh).unwrap_err();
        assert_eq!(err.code(), kernel_api::EINVAL);
        assert!(mmu.map_memory_as_course_page(&cs, page, MapMode::Replace).is_ok());
    }

    #[test]
    fn test_course_page_conflicts() {
        let (mut mmu, irq) = setup();
        let cs = CriticalSection::enter(&irq);
        // Inside a section
        let inside_section =
            MemorySection::identity(0x1000_0000, 0x1000, domain(SHARED), AccessPermission::ReadWrite);
        assert!(mmu.map_memory_as_course_page(&cs, inside_section, MapMode::Replace).is_err());

        // Misaligned
        let misaligned =
            MemorySection::identity(0x1300_0800, 0x1000, domain(SHARED), AccessPermission::ReadWrite);
        assert!(mmu.map_memory_as_course_page(&cs, misaligned, MapMode::Fresh).is_err());

        // Different domain than the existing table
        let first = MemorySection::identity(0x1300_0000, 0x1000, domain(SHARED), AccessPermission::ReadWrite);
        mmu.map_memory_as_course_page(&cs, first, MapMode::Fresh).unwrap();
        let other =
            MemorySection::identity(0x1300_1000, 0x1000, domain(PRIVATE_A), AccessPermission::ReadWrite);
        assert!(mmu.map_memory_as_course_page(&cs, other, MapMode::Fresh).is_err());
    }

    #[test]
    fn test_coarse_pool_exhaustion() {
        let irq = irq();
        let mut mmu = Mmu::new(1);
        let cs = CriticalSection::enter(&irq);
        let two_mib = MemorySection::identity(0x1300_F000, 0x2000, domain(SHARED), AccessPermission::ReadWrite);
        let err = mmu.map_memory_as_course_page(&cs, two_mib, MapMode::Fresh).unwrap_err();
        assert_eq!(err.code(), kernel_api::EMAX);
        assert_eq!(mmu.coarse_tables_used(), 0);
    }

    #[test]
    fn test_map_memory_splits_sections_and_pages() {
        let irq = irq();
        let mut mmu = Mmu::new(4);
        let cs = CriticalSection::enter(&irq);
        // 4 KiB short of the MiB boundary, then one full MiB, then a tail page
        let range = MemorySection::identity(
            0x013F_F000,
            0x1000 + SECTION_SIZE + 0x1000,
            domain(SHARED),
            AccessPermission::ReadWrite,
        );
        mmu.map_memory(&cs, range, MapMode::Fresh).unwrap();

        assert!(matches!(mmu.entry_for(ProcessId::KERNEL, 0x13), FirstLevelEntry::CoarseTable { .. }));
        assert!(matches!(mmu.entry_for(ProcessId::KERNEL, 0x14), FirstLevelEntry::Section { .. }));
        assert!(matches!(mmu.entry_for(ProcessId::KERNEL, 0x15), FirstLevelEntry::CoarseTable { .. }));
        assert_eq!(mmu.coarse_tables_used(), 2);
        assert!(mmu.map_memory(&cs, range, MapMode::Fresh).is_err());
    }

    #[test]
    fn test_hardware_view_follows_active_process() {
        let (mut mmu, irq) = setup();
        let cs = CriticalSection::enter(&irq);
        let shared_view = MemorySection {
            physical: 0x0D80_0000,
            virtual_address: 0x0D00_0000,
            size: SECTION_SIZE,
            domain: domain(SHARED),
            access: AccessPermission::ReadOnly,
            cached: false,
        };
        mmu.map_memory_as_section(&cs, shared_view).unwrap();
        mmu.set_hardware_view(
            &cs,
            pid(2),
            Some(FirstLevelEntry::Section {
                base: 0x0DC0_0000,
                domain: domain(SHARED),
                access: AccessPermission::ReadWrite,
                cached: false,
            }),
        );

        mmu.activate(&cs, pid(1));
        assert_eq!(mmu.translate(0x0D00_0010), Some(0x0D80_0010));
        mmu.activate(&cs, pid(2));
        assert_eq!(mmu.translate(0x0D00_0010), Some(0x0DC0_0010));
        assert_eq!(mmu.first_level_bits(HARDWARE_VIEW_INDEX) & descriptor::SECTION_BASE_MASK, 0x0DC0_0000);

        // Same virtual address, different rights
        drop(cs);
        assert!(mmu
            .check_memory_pointer(0x0D00_0000, 4, AccessKind::Write, pid(1), pid(1))
            .is_err());
        assert!(mmu
            .check_memory_pointer(0x0D00_0000, 4, AccessKind::Write, pid(2), pid(2))
            .is_ok());
    }
}
