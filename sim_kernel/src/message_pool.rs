//! Message slots
//!
//! Every thread owns one message slot; a shared pool of spare slots covers
//! asynchronous calls and threads whose own slot is still on loan. A slot is
//! handed out as a [`SlotLease`] that must be given back exactly once.

use crate::layout::MESSAGE_POOL_BASE;
use core_types::ThreadId;
use ipc::MESSAGE_SIZE;

/// Exclusive right to one message slot
///
/// Neither `Clone` nor `Copy`: the only way to end a loan is to move the
/// lease into [`MessagePool::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct SlotLease {
    index: usize,
    /// Reserving thread and the generation of its slot at lending time
    reserved_by: Option<(ThreadId, u32)>,
}

impl SlotLease {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Kernel address of the slot's encoded `IpcMessage`
    pub fn address(&self) -> u32 {
        slot_address(self.index)
    }
}

/// Kernel address of slot `index`
pub fn slot_address(index: usize) -> u32 {
    MESSAGE_POOL_BASE + (index * MESSAGE_SIZE) as u32
}

/// How a call wants its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LendPolicy {
    /// The thread's own slot, then a spare one
    Sync(ThreadId),
    /// A spare slot counted against the thread's reservations
    Async(ThreadId),
    /// A spare slot with no owning thread
    Unowned,
}

/// Own-slot and spare-slot bookkeeping
#[derive(Debug)]
pub struct MessagePool {
    own: Vec<bool>,
    spare: Vec<bool>,
    reservations: Vec<u32>,
    generations: Vec<u32>,
}

impl MessagePool {
    pub fn new(threads: usize, spares: usize) -> Self {
        Self {
            own: vec![false; threads],
            spare: vec![false; spares],
            reservations: vec![0; threads],
            generations: vec![0; threads],
        }
    }

    /// Lends a slot, or `None` when every candidate is on loan
    pub fn lend(&mut self, policy: LendPolicy) -> Option<SlotLease> {
        match policy {
            LendPolicy::Sync(thread) => {
                if let Some(own @ false) = self.own.get_mut(thread.index()) {
                    *own = true;
                    return Some(SlotLease {
                        index: thread.index(),
                        reserved_by: None,
                    });
                }
                self.lend_spare(None)
            }
            LendPolicy::Async(thread) => self.lend_spare(Some(thread)),
            LendPolicy::Unowned => self.lend_spare(None),
        }
    }

    fn lend_spare(&mut self, thread: Option<ThreadId>) -> Option<SlotLease> {
        let slot = self.spare.iter().position(|on_loan| !on_loan)?;
        self.spare[slot] = true;
        let reserved_by = thread.and_then(|t| {
            let count = self.reservations.get_mut(t.index())?;
            *count = count.saturating_add(1);
            Some((t, self.generations[t.index()]))
        });
        Some(SlotLease {
            index: self.own.len() + slot,
            reserved_by,
        })
    }

    /// Ends a loan
    pub fn release(&mut self, lease: SlotLease) {
        if lease.index < self.own.len() {
            self.own[lease.index] = false;
        } else if let Some(slot) = self.spare.get_mut(lease.index - self.own.len()) {
            *slot = false;
        }
        if let Some((thread, generation)) = lease.reserved_by {
            // A lease that outlived its thread no longer counts
            if self.generations.get(thread.index()) == Some(&generation) {
                let count = &mut self.reservations[thread.index()];
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Outstanding asynchronous requests of a thread
    pub fn reservations(&self, thread: ThreadId) -> u32 {
        self.reservations.get(thread.index()).copied().unwrap_or(0)
    }

    /// Forgets a recycled thread slot's reservation count
    ///
    /// Loans stay on loan; only the reply that owns them can return them.
    /// Their release no longer touches the slot's new count.
    pub fn reset_thread(&mut self, thread: ThreadId) {
        if let Some(count) = self.reservations.get_mut(thread.index()) {
            *count = 0;
            let generation = &mut self.generations[thread.index()];
            *generation = generation.wrapping_add(1);
        }
    }

    pub fn is_on_loan(&self, index: usize) -> bool {
        if index < self.own.len() {
            self.own[index]
        } else {
            self.spare
                .get(index - self.own.len())
                .copied()
                .unwrap_or(false)
        }
    }

    pub fn loans_outstanding(&self) -> usize {
        self.own.iter().chain(self.spare.iter()).filter(|l| **l).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(raw: usize) -> ThreadId {
        ThreadId::from_index(raw)
    }

    #[test]
    fn test_sync_prefers_own_slot() {
        let mut pool = MessagePool::new(4, 2);
        let first = pool.lend(LendPolicy::Sync(t(2))).unwrap();
        assert_eq!(first.index(), 2);
        assert_eq!(first.address(), MESSAGE_POOL_BASE + 2 * 0x34);

        // Own slot busy: falls back to a spare
        let second = pool.lend(LendPolicy::Sync(t(2))).unwrap();
        assert_eq!(second.index(), 4);
        assert_eq!(pool.reservations(t(2)), 0);

        pool.release(first);
        assert!(!pool.is_on_loan(2));
        assert!(pool.is_on_loan(4));
    }

    #[test]
    fn test_async_counts_reservations() {
        let mut pool = MessagePool::new(4, 2);
        let a = pool.lend(LendPolicy::Async(t(1))).unwrap();
        let b = pool.lend(LendPolicy::Async(t(1))).unwrap();
        assert_eq!(pool.reservations(t(1)), 2);
        assert!(pool.lend(LendPolicy::Async(t(3))).is_none());

        pool.release(a);
        assert_eq!(pool.reservations(t(1)), 1);
        pool.release(b);
        assert_eq!(pool.loans_outstanding(), 0);
    }

    #[test]
    fn test_stale_lease_spares_recycled_thread_count() {
        let mut pool = MessagePool::new(4, 2);
        let stale = pool.lend(LendPolicy::Async(t(1))).unwrap();
        pool.reset_thread(t(1));
        let fresh = pool.lend(LendPolicy::Async(t(1))).unwrap();
        assert_eq!(pool.reservations(t(1)), 1);

        pool.release(stale);
        assert_eq!(pool.reservations(t(1)), 1);
        pool.release(fresh);
        assert_eq!(pool.reservations(t(1)), 0);
        assert_eq!(pool.loans_outstanding(), 0);
    }

    #[test]
    fn test_unowned_uses_spares_only() {
        let mut pool = MessagePool::new(2, 1);
        let lease = pool.lend(LendPolicy::Unowned).unwrap();
        assert_eq!(lease.index(), 2);
        assert!(pool.lend(LendPolicy::Unowned).is_none());
    }
}
