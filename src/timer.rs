//! Timer queue
//!
//! A min-heap of deadlines keyed by unique timer ids. Deleting a timer only
//! drops its payload; stale heap entries are skipped when they surface.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::core::Tick;

/// Unique identifier of a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u32);

impl TimerId {
    pub fn get(self) -> u32 {
        self.0
    }
}

/// Timers ordered by expiry tick, carrying a payload of type `E`
#[derive(Debug)]
pub struct TimerQueue<E> {
    heap: BinaryHeap<Reverse<(Tick, TimerId)>>,
    pending: HashMap<TimerId, (Tick, E)>,
    next_id: u32,
}

impl<E> Default for TimerQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> TimerQueue<E> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            next_id: 1,
        }
    }

    /// Schedule `event` to fire at `tick`
    pub fn add_timer(&mut self, tick: Tick, event: E) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.heap.push(Reverse((tick, id)));
        self.pending.insert(id, (tick, event));
        id
    }

    /// Cancel a timer, returning its payload if it was still pending
    pub fn delete_timer(&mut self, id: TimerId) -> Option<E> {
        self.pending.remove(&id).map(|(_, event)| event)
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Remove and return the earliest timer due at or before `now`
    pub fn pop_expired(&mut self, now: Tick) -> Option<(TimerId, E)> {
        while let Some(Reverse((tick, id))) = self.heap.peek().copied() {
            if !self.pending.contains_key(&id) {
                self.heap.pop();
                continue;
            }
            if tick > now {
                return None;
            }
            self.heap.pop();
            return self.pending.remove(&id).map(|(_, event)| (id, event));
        }
        None
    }

    /// Tick of the next live timer
    pub fn next_tick(&self) -> Option<Tick> {
        self.pending.values().map(|(tick, _)| *tick).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_in_deadline_order() {
        let mut q = TimerQueue::new();
        q.add_timer(30, "c");
        q.add_timer(10, "a");
        q.add_timer(20, "b");

        assert!(q.pop_expired(5).is_none());
        assert_eq!(q.pop_expired(100).map(|(_, e)| e), Some("a"));
        assert_eq!(q.pop_expired(100).map(|(_, e)| e), Some("b"));
        assert_eq!(q.pop_expired(100).map(|(_, e)| e), Some("c"));
        assert!(q.is_empty());
    }

    #[test]
    fn test_delete_timer() {
        let mut q = TimerQueue::new();
        let a = q.add_timer(10, 1);
        let b = q.add_timer(20, 2);
        assert_ne!(a, b);

        assert_eq!(q.delete_timer(a), Some(1));
        assert_eq!(q.delete_timer(a), None);
        assert!(!q.contains(a));
        assert_eq!(q.next_tick(), Some(20));
        assert_eq!(q.pop_expired(50).map(|(id, _)| id), Some(b));
        assert!(q.pop_expired(50).is_none());
    }

    #[test]
    fn test_not_yet_due() {
        let mut q = TimerQueue::new();
        q.add_timer(100, ());
        assert!(q.pop_expired(99).is_none());
        assert_eq!(q.len(), 1);
        assert!(q.pop_expired(100).is_some());
    }
}
