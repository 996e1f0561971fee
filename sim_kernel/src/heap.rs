//! User heaps
//!
//! A heap manages a caller-supplied buffer in 32-byte units. Allocation is
//! first-fit over the free list in address order; freed blocks merge with
//! their free neighbours. The kernel never touches the buffer's contents.

use crate::SimulatedKernel;
use core_types::{AccessKind, HeapId, ProcessId};
use kernel_api::KernelError;
use log::debug;
use std::collections::BTreeMap;

/// Allocation unit and minimum alignment
pub const HEAP_GRANULE: u32 = 32;

fn round_up(value: u32, to: u32) -> Option<u32> {
    value.checked_add(to - 1).map(|v| v & !(to - 1))
}

/// One heap's bookkeeping
#[derive(Debug, Clone)]
pub struct Heap {
    pub owner: ProcessId,
    pub base: u32,
    pub size: u32,
    /// Free blocks: address to length
    free: BTreeMap<u32, u32>,
    /// Live allocations: address to length
    allocated: BTreeMap<u32, u32>,
}

impl Heap {
    pub fn new(owner: ProcessId, base: u32, size: u32) -> Self {
        Self {
            owner,
            base,
            size,
            free: BTreeMap::from([(base, size)]),
            allocated: BTreeMap::new(),
        }
    }

    /// First-fit allocation of `size` bytes aligned to `align`
    pub fn allocate(&mut self, size: u32, align: u32) -> Result<u32, KernelError> {
        if size == 0 {
            return Err(KernelError::InvalidArgument("zero-sized allocation"));
        }
        if !align.is_power_of_two() {
            return Err(KernelError::InvalidArgument("alignment is not a power of two"));
        }
        let align = align.max(HEAP_GRANULE);
        let size = round_up(size, HEAP_GRANULE).ok_or(KernelError::OutOfMemory)?;

        let (block, block_len, start) = self
            .free
            .iter()
            .find_map(|(&block, &len)| {
                let start = round_up(block, align)?;
                let end = start.checked_add(size)?;
                (end <= block + len).then_some((block, len, start))
            })
            .ok_or(KernelError::OutOfMemory)?;

        self.free.remove(&block);
        if start > block {
            self.free.insert(block, start - block);
        }
        let tail = (block + block_len) - (start + size);
        if tail > 0 {
            self.free.insert(start + size, tail);
        }
        self.allocated.insert(start, size);
        Ok(start)
    }

    pub fn free(&mut self, ptr: u32) -> Result<(), KernelError> {
        let mut len = self
            .allocated
            .remove(&ptr)
            .ok_or(KernelError::InvalidArgument("pointer was not allocated here"))?;
        let mut start = ptr;
        if let Some(next) = self.free.remove(&(ptr + len)) {
            len += next;
        }
        if let Some((&prev, &prev_len)) = self.free.range(..ptr).next_back() {
            if prev + prev_len == ptr {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        self.free.insert(start, len);
        Ok(())
    }

    pub fn free_bytes(&self) -> u32 {
        self.free.values().sum()
    }

    pub fn allocations(&self) -> usize {
        self.allocated.len()
    }
}

impl SimulatedKernel {
    fn heap_mut(&mut self, heap: HeapId) -> Result<&mut Heap, KernelError> {
        let process = self.caller_process();
        let entry = self
            .heaps
            .get_mut(heap.index())
            .and_then(Option::as_mut)
            .ok_or(KernelError::InvalidArgument("no such heap"))?;
        if entry.owner != process && !process.is_kernel() {
            return Err(KernelError::AccessDenied("heap belongs to another process"));
        }
        Ok(entry)
    }

    pub(crate) fn sys_create_heap(&mut self, buffer: u32, size: u32) -> Result<HeapId, KernelError> {
        self.caller()?;
        let owner = self.caller_process();
        if buffer % HEAP_GRANULE != 0 || size == 0 {
            return Err(KernelError::InvalidArgument("heap buffer misaligned or empty"));
        }
        let size = size & !(HEAP_GRANULE - 1);
        if size == 0 {
            return Err(KernelError::InvalidArgument("heap smaller than one granule"));
        }
        self.mmu
            .check_memory_pointer(buffer, size, AccessKind::Write, owner, owner)?;
        let slot = self
            .heaps
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::Exhausted("heap table"))?;
        self.heaps[slot] = Some(Heap::new(owner, buffer, size));
        let heap = HeapId::from_index(slot);
        debug!("{} at {:#010x}+{:#x} for {}", heap, buffer, size, owner);
        Ok(heap)
    }

    pub(crate) fn sys_destroy_heap(&mut self, heap: HeapId) -> Result<(), KernelError> {
        self.caller()?;
        self.heap_mut(heap)?;
        self.heaps[heap.index()] = None;
        Ok(())
    }

    pub(crate) fn sys_allocate_on_heap(
        &mut self,
        heap: HeapId,
        size: u32,
        align: u32,
    ) -> Result<u32, KernelError> {
        self.caller()?;
        self.heap_mut(heap)?.allocate(size, align)
    }

    pub(crate) fn sys_free_on_heap(&mut self, heap: HeapId, ptr: u32) -> Result<(), KernelError> {
        self.caller()?;
        self.heap_mut(heap)?.free(ptr)
    }

    pub fn heap(&self, heap: HeapId) -> Option<&Heap> {
        self.heaps.get(heap.index()).and_then(Option::as_ref)
    }
}
