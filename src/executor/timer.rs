//! Per-bucket timer queue
//!
//! Timers are ordinary tasks with a deadline. They live in the owning
//! bucket's queue and run on the bucket thread, so a timer never races with
//! other tasks for the same key. Scheduling under an existing key replaces
//! the previous timer; cancelling removes it. Stale heap slots are skipped
//! lazily.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::hash::Hash;
use std::time::Instant;

use ahash::AHashMap;

use super::Task;

struct Pending<S, K> {
    key: K,
    task: Task<S, K>,
}

/// Deadline-ordered queue of keyed tasks
pub struct TimerQueue<S, K> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    pending: AHashMap<u64, Pending<S, K>>,
    by_key: AHashMap<K, u64>,
    next_seq: u64,
}

impl<S, K> TimerQueue<S, K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: AHashMap::new(),
            by_key: AHashMap::new(),
            next_seq: 0,
        }
    }

    /// Schedule `task` at `deadline`, replacing any timer under `key`
    pub fn schedule(&mut self, key: K, deadline: Instant, task: Task<S, K>) {
        self.cancel(&key);

        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse((deadline, seq)));
        self.by_key.insert(key.clone(), seq);
        self.pending.insert(seq, Pending { key, task });
    }

    /// Cancel the timer under `key`; returns true if one was pending
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.by_key.remove(key) {
            Some(seq) => self.pending.remove(&seq).is_some(),
            None => false,
        }
    }

    #[cfg(test)]
    pub fn contains(&self, key: &K) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Earliest live deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, seq))) = self.heap.peek().copied() {
            if self.pending.contains_key(&seq) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop the next task whose deadline is at or before `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<Task<S, K>> {
        while let Some(Reverse((deadline, seq))) = self.heap.peek().copied() {
            if !self.pending.contains_key(&seq) {
                self.heap.pop();
                continue;
            }
            if deadline > now {
                return None;
            }
            self.heap.pop();
            let entry = self.pending.remove(&seq)?;
            if self.by_key.get(&entry.key) == Some(&seq) {
                self.by_key.remove(&entry.key);
            }
            return Some(entry.task);
        }
        None
    }

    /// Drop every pending timer
    pub fn clear(&mut self) {
        self.heap.clear();
        self.pending.clear();
        self.by_key.clear();
    }
}

impl<S, K> Default for TimerQueue<S, K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
