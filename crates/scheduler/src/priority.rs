//! Keyed priority queue with requeue
//!
//! Entries are dequeued most urgent first (lowest priority value), FIFO
//! within equal priorities. Pushing a key that is already queued requeues it
//! at the new priority instead of adding a second entry: the old heap entry
//! stays in place and is skipped when it surfaces.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

/// Heap entry; ordered so the max-heap yields the lowest priority value first
#[derive(Debug, Clone)]
struct Entry<K, P> {
    key: K,
    priority: P,
    insertion_order: u64,
}

impl<K, P: Ord> PartialEq for Entry<K, P> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K, P: Ord> Eq for Entry<K, P> {}

impl<K, P: Ord> PartialOrd for Entry<K, P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K, P: Ord> Ord for Entry<K, P> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed on both fields because BinaryHeap is a max heap
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.insertion_order.cmp(&self.insertion_order))
    }
}

/// Priority queue keyed by `K`, holding at most one live entry per key
#[derive(Debug)]
pub struct PriorityQueue<K, P> {
    heap: BinaryHeap<Entry<K, P>>,
    /// Live entries: key -> (priority, insertion order of the live heap entry)
    live: HashMap<K, (P, u64)>,
    insertion_counter: u64,
}

impl<K, P> PriorityQueue<K, P>
where
    K: Eq + Hash + Clone,
    P: Ord + Clone,
{
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            insertion_counter: 0,
        }
    }

    /// Queue `key`, or requeue it if already present; returns `true` if it was new
    pub fn push(&mut self, key: K, priority: P) -> bool {
        let insertion_order = self.insertion_counter;
        self.insertion_counter += 1;
        let is_new = self
            .live
            .insert(key.clone(), (priority.clone(), insertion_order))
            .is_none();
        self.heap.push(Entry {
            key,
            priority,
            insertion_order,
        });
        self.compact_if_needed();
        is_new
    }

    /// Remove the most urgent entry
    pub fn pop(&mut self) -> Option<(K, P)> {
        while let Some(entry) = self.heap.pop() {
            if self.is_live(&entry) {
                self.live.remove(&entry.key);
                return Some((entry.key, entry.priority));
            }
        }
        None
    }

    /// Remove `key`; returns its priority if it was queued
    pub fn remove(&mut self, key: &K) -> Option<P> {
        let removed = self.live.remove(key).map(|(priority, _)| priority);
        if removed.is_some() {
            self.compact_if_needed();
        }
        removed
    }

    pub fn contains(&self, key: &K) -> bool {
        self.live.contains_key(key)
    }

    pub fn priority(&self, key: &K) -> Option<&P> {
        self.live.get(key).map(|(priority, _)| priority)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    fn is_live(&self, entry: &Entry<K, P>) -> bool {
        self.live
            .get(&entry.key)
            .map_or(false, |(_, order)| *order == entry.insertion_order)
    }

    /// Drop superseded heap entries once they dominate the heap
    fn compact_if_needed(&mut self) {
        if self.heap.len() <= 2 * self.live.len() + 32 {
            return;
        }
        let live = &self.live;
        let entries: Vec<Entry<K, P>> = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .filter(|entry| {
                live.get(&entry.key)
                    .map_or(false, |(_, order)| *order == entry.insertion_order)
            })
            .collect();
        self.heap = BinaryHeap::from(entries);
    }
}

impl<K, P> Default for PriorityQueue<K, P>
where
    K: Eq + Hash + Clone,
    P: Ord + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
