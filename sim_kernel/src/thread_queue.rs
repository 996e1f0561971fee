//! Priority-ordered thread queues
//!
//! Used as the ready queue and as every blocking queue. Queues store thread
//! ids with the priority they were queued at; the threads themselves live in
//! the scheduler's arena.

use core_types::ThreadId;
use serde::{Deserialize, Serialize};

/// Placement of a thread among queued threads of equal priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TieBreak {
    /// Newest first: linked ahead of the first entry of equal or lower priority
    Lifo,
    /// Oldest first: linked ahead of the first entry of strictly lower priority
    Fifo,
}

/// A priority-ordered list of thread ids; higher numeric priority first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadQueue {
    tie_break: TieBreak,
    entries: Vec<(ThreadId, u8)>,
}

impl ThreadQueue {
    pub fn new(tie_break: TieBreak) -> Self {
        Self {
            tie_break,
            entries: Vec::new(),
        }
    }

    pub fn lifo() -> Self {
        Self::new(TieBreak::Lifo)
    }

    pub fn fifo() -> Self {
        Self::new(TieBreak::Fifo)
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Links `thread` at its priority position
    pub fn push(&mut self, thread: ThreadId, priority: u8) {
        let position = match self.tie_break {
            TieBreak::Lifo => self.entries.iter().position(|&(_, p)| p <= priority),
            TieBreak::Fifo => self.entries.iter().position(|&(_, p)| p < priority),
        };
        self.entries
            .insert(position.unwrap_or(self.entries.len()), (thread, priority));
    }

    pub fn pop_front(&mut self) -> Option<ThreadId> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0).0)
        }
    }

    /// Head of the queue and the priority it was queued at
    pub fn peek(&self) -> Option<(ThreadId, u8)> {
        self.entries.first().copied()
    }

    /// Unlinks `thread`; returns false if it was not queued
    pub fn remove(&mut self, thread: ThreadId) -> bool {
        match self.entries.iter().position(|&(t, _)| t == thread) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.entries.iter().any(|&(t, _)| t == thread)
    }

    /// Re-links `thread` at a new priority
    pub fn reprioritize(&mut self, thread: ThreadId, priority: u8) -> bool {
        if self.remove(thread) {
            self.push(thread, priority);
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.entries.iter().map(|&(t, _)| t)
    }

    /// Empties the queue, returning the threads in queue order
    pub fn drain(&mut self) -> Vec<ThreadId> {
        self.entries.drain(..).map(|(t, _)| t).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(raw: usize) -> ThreadId {
        ThreadId::from_index(raw)
    }

    #[test]
    fn test_higher_priority_first() {
        let mut queue = ThreadQueue::lifo();
        queue.push(t(1), 10);
        queue.push(t(2), 50);
        queue.push(t(3), 30);
        assert_eq!(queue.drain(), vec![t(2), t(3), t(1)]);
    }

    #[test]
    fn test_lifo_among_equal_priority() {
        let mut queue = ThreadQueue::lifo();
        for raw in 1..=4 {
            queue.push(t(raw), 20);
        }
        queue.push(t(9), 10);
        assert_eq!(queue.drain(), vec![t(4), t(3), t(2), t(1), t(9)]);
    }

    #[test]
    fn test_fifo_among_equal_priority() {
        let mut queue = ThreadQueue::fifo();
        queue.push(t(1), 20);
        queue.push(t(2), 20);
        queue.push(t(3), 40);
        queue.push(t(4), 20);
        assert_eq!(queue.drain(), vec![t(3), t(1), t(2), t(4)]);
    }

    #[test]
    fn test_remove_and_reprioritize() {
        let mut queue = ThreadQueue::lifo();
        queue.push(t(1), 10);
        queue.push(t(2), 20);
        assert!(queue.reprioritize(t(1), 30));
        assert_eq!(queue.peek(), Some((t(1), 30)));
        assert!(queue.remove(t(2)));
        assert!(!queue.remove(t(2)));
        assert!(!queue.reprioritize(t(2), 1));
        assert_eq!(queue.len(), 1);
    }
}
