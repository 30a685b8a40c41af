use std::collections::BTreeMap;

use chunkstream_cache::{ChunkKey, ChunkPriority};

/// Chunks one layer currently needs, with their priorities
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkingSet {
    entries: BTreeMap<ChunkKey, ChunkPriority>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a chunk; a chunk reached twice keeps its more urgent priority
    pub fn insert(&mut self, key: ChunkKey, priority: ChunkPriority) {
        self.entries
            .entry(key)
            .and_modify(|existing| {
                if priority < *existing {
                    *existing = priority;
                }
            })
            .or_insert(priority);
    }

    pub fn get(&self, key: &ChunkKey) -> Option<ChunkPriority> {
        self.entries.get(key).copied()
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChunkKey, &ChunkPriority)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ChunkKey> {
        self.entries.keys()
    }

    /// Entries ordered most urgent first
    pub fn by_priority(&self) -> Vec<(ChunkKey, ChunkPriority)> {
        let mut entries: Vec<_> = self.entries.iter().map(|(k, p)| (*k, *p)).collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }
}

impl FromIterator<(ChunkKey, ChunkPriority)> for WorkingSet {
    fn from_iter<I: IntoIterator<Item = (ChunkKey, ChunkPriority)>>(iter: I) -> Self {
        let mut set = WorkingSet::new();
        for (key, priority) in iter {
            set.insert(key, priority);
        }
        set
    }
}

/// Changes between two working sets of the same layer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkingSetDelta {
    /// Newly needed chunks, most urgent first
    pub added: Vec<(ChunkKey, ChunkPriority)>,
    /// Chunks no longer needed; interest is withdrawn, nothing is evicted
    pub removed: Vec<ChunkKey>,
    /// Chunks still needed at a different priority
    pub reprioritized: Vec<(ChunkKey, ChunkPriority)>,
}

impl WorkingSetDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.reprioritized.is_empty()
    }

    /// Delta withdrawing every entry of `set`
    pub fn removing_all(set: &WorkingSet) -> Self {
        Self {
            removed: set.keys().copied().collect(),
            ..Self::default()
        }
    }
}

pub fn diff(previous: &WorkingSet, next: &WorkingSet) -> WorkingSetDelta {
    let mut delta = WorkingSetDelta::default();

    for (key, priority) in next.iter() {
        match previous.get(key) {
            None => delta.added.push((*key, *priority)),
            Some(old) if old != *priority => delta.reprioritized.push((*key, *priority)),
            Some(_) => {}
        }
    }
    delta.removed = previous
        .keys()
        .filter(|key| !next.contains(key))
        .copied()
        .collect();

    delta.added.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkstream_cache::{GridPosition, SourceId};

    fn key(x: i64) -> ChunkKey {
        ChunkKey::new(SourceId(7), GridPosition::new(x, 0, 0))
    }

    fn set(entries: &[(i64, f32)]) -> WorkingSet {
        entries
            .iter()
            .map(|(x, rank)| (key(*x), ChunkPriority::visible(*rank)))
            .collect()
    }

    #[test]
    fn diff_requests_only_new_and_withdraws_only_dropped() {
        let before = set(&[(1, 0.0), (2, 1.0), (3, 2.0)]);
        let after = set(&[(3, 2.0), (4, 0.0), (5, 1.0)]);

        let delta = diff(&before, &after);
        assert_eq!(
            delta.added,
            vec![
                (key(4), ChunkPriority::visible(0.0)),
                (key(5), ChunkPriority::visible(1.0)),
            ]
        );
        assert_eq!(delta.removed, vec![key(1), key(2)]);
        assert!(delta.reprioritized.is_empty());
    }

    #[test]
    fn identical_sets_diff_to_nothing() {
        let current = set(&[(1, 0.0), (2, 3.0)]);
        assert!(diff(&current, &current.clone()).is_empty());
    }

    #[test]
    fn priority_change_is_a_reprioritization() {
        let before = set(&[(1, 0.0), (2, 1.0)]);
        let after = set(&[(1, 5.0), (2, 1.0)]);
        let delta = diff(&before, &after);
        assert_eq!(delta.reprioritized, vec![(key(1), ChunkPriority::visible(5.0))]);
        assert!(delta.added.is_empty() && delta.removed.is_empty());
    }

    #[test]
    fn duplicate_insert_keeps_most_urgent() {
        let mut working_set = WorkingSet::new();
        working_set.insert(key(1), ChunkPriority::prefetch(0.0));
        working_set.insert(key(1), ChunkPriority::visible(9.0));
        working_set.insert(key(1), ChunkPriority::visible(12.0));
        assert_eq!(working_set.get(&key(1)), Some(ChunkPriority::visible(9.0)));
    }

    #[test]
    fn removing_all_lists_every_key() {
        let current = set(&[(1, 0.0), (2, 0.0)]);
        let delta = WorkingSetDelta::removing_all(&current);
        assert_eq!(delta.removed, vec![key(1), key(2)]);
        assert!(delta.added.is_empty());
    }

    fn arbitrary_set() -> impl proptest::strategy::Strategy<Value = WorkingSet> {
        use proptest::prelude::*;
        proptest::collection::vec((0i64..24, 0u8..6), 0..24).prop_map(|entries| {
            entries
                .into_iter()
                .map(|(x, rank)| (key(x), ChunkPriority::visible(f32::from(rank))))
                .collect()
        })
    }

    proptest::proptest! {
        #[test]
        fn applying_the_delta_reproduces_the_next_set(
            before in arbitrary_set(),
            after in arbitrary_set(),
        ) {
            let delta = diff(&before, &after);
            let mut entries: BTreeMap<ChunkKey, ChunkPriority> =
                before.iter().map(|(k, p)| (*k, *p)).collect();
            for key in &delta.removed {
                proptest::prop_assert!(entries.remove(key).is_some());
            }
            for (key, priority) in &delta.added {
                proptest::prop_assert!(entries.insert(*key, *priority).is_none());
            }
            for (key, priority) in &delta.reprioritized {
                proptest::prop_assert!(entries.insert(*key, *priority).is_some());
            }
            let expected: BTreeMap<ChunkKey, ChunkPriority> =
                after.iter().map(|(k, p)| (*k, *p)).collect();
            proptest::prop_assert_eq!(entries, expected);
        }
    }
}
