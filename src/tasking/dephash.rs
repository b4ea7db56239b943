use super::task::Task;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A dependency location normalized to the global unit owning it.
/// Every unit derives the same key for the same global pointer.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct DepKey {
    pub(crate) unit: usize,
    pub(crate) team: u16,
    pub(crate) segid: i16,
    pub(crate) offset: u64,
}

#[derive(Default)]
struct DepEntry {
    /// writers of the location in creation order, with their phase
    producers: Vec<(u64, Arc<Task>)>,
    /// readers since the last writer
    readers: Vec<Arc<Task>>,
}

/// Per-unit dependency hash, sharded by segment.
pub(crate) struct DepHash {
    shards: Vec<Mutex<HashMap<DepKey, DepEntry>>>,
}

impl DepHash {
    pub(crate) fn new(num_shards: usize) -> DepHash {
        DepHash {
            shards: (0..num_shards.max(1))
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, key: &DepKey) -> &Mutex<HashMap<DepKey, DepEntry>> {
        let mut hasher = DefaultHasher::new();
        (key.team, key.segid).hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }

    /// `task` reads `key`: depend on the latest local writer created in a phase not
    /// after `phase`
    pub(crate) fn add_input(&self, task: &Arc<Task>, key: DepKey, phase: u64) {
        let mut shard = self.shard(&key).lock();
        let entry = shard.entry(key).or_default();
        if let Some((_, producer)) = entry.producers.iter().rev().find(|(p, _)| *p <= phase) {
            if !Arc::ptr_eq(producer, task) {
                producer.add_successor(task);
            }
        }
        entry.readers.retain(|r| !r.state().is_terminal());
        entry.readers.push(task.clone());
    }

    /// `task` writes `key`: depend on the latest writer and every reader since, then
    /// become the latest writer
    pub(crate) fn add_output(&self, task: &Arc<Task>, key: DepKey) {
        let mut shard = self.shard(&key).lock();
        let entry = shard.entry(key).or_default();
        if let Some((_, producer)) = entry.producers.last() {
            if !Arc::ptr_eq(producer, task) {
                producer.add_successor(task);
            }
        }
        for reader in entry.readers.drain(..) {
            if !Arc::ptr_eq(&reader, task) {
                reader.add_successor(task);
            }
        }
        // writers are chained, a finished one has no unfinished predecessor
        entry.producers.retain(|(_, p)| !p.state().is_terminal());
        entry.producers.push((task.phase, task.clone()));
    }

    /// The latest writer of `key` created in a phase not after `phase`
    pub(crate) fn latest_producer(&self, key: &DepKey, phase: u64) -> Option<Arc<Task>> {
        let shard = self.shard(key).lock();
        shard.get(key).and_then(|entry| {
            entry
                .producers
                .iter()
                .rev()
                .find(|(p, _)| *p <= phase)
                .map(|(_, t)| t.clone())
        })
    }

    /// Forget every recorded access, used once all tasks completed
    pub(crate) fn clear(&self) {
        for shard in self.shards.iter() {
            shard.lock().clear();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    #[cfg(test)]
    fn num_producers(&self, key: &DepKey) -> usize {
        self.shard(key).lock().get(key).map_or(0, |e| e.producers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasking::task::TaskState;

    fn task(id: u64, phase: u64) -> Arc<Task> {
        Arc::new(Task::new(id, 0, phase, None, Box::new(|| {})))
    }

    const KEY: DepKey = DepKey {
        unit: 0,
        team: 0,
        segid: 1,
        offset: 8,
    };

    #[test]
    fn read_after_write() {
        let hash = DepHash::new(4);
        let writer = task(1, 0);
        let reader = task(2, 0);
        hash.add_output(&writer, KEY);
        hash.add_input(&reader, KEY, 0);
        assert_eq!(reader.num_unresolved(), 1);
        let other = DepKey { offset: 16, ..KEY };
        let unrelated = task(3, 0);
        hash.add_input(&unrelated, other, 0);
        assert_eq!(unrelated.num_unresolved(), 0);
    }

    #[test]
    fn write_after_read_and_write() {
        let hash = DepHash::new(4);
        let w1 = task(1, 0);
        let r1 = task(2, 0);
        let r2 = task(3, 0);
        let w2 = task(4, 0);
        hash.add_output(&w1, KEY);
        hash.add_input(&r1, KEY, 0);
        hash.add_input(&r2, KEY, 0);
        hash.add_output(&w2, KEY);
        // edges from w1, r1, r2
        assert_eq!(w2.num_unresolved(), 3);
        let r3 = task(5, 0);
        hash.add_input(&r3, KEY, 0);
        assert_eq!(r3.num_unresolved(), 1);
    }

    #[test]
    fn finished_producer_adds_no_edge() {
        let hash = DepHash::new(1);
        let writer = task(1, 0);
        hash.add_output(&writer, KEY);
        writer.close(TaskState::Done);
        let reader = task(2, 0);
        hash.add_input(&reader, KEY, 0);
        assert_eq!(reader.num_unresolved(), 0);
    }

    #[test]
    fn producer_by_phase() {
        let hash = DepHash::new(2);
        let w0 = task(1, 0);
        let w2 = task(2, 2);
        hash.add_output(&w0, KEY);
        hash.add_output(&w2, KEY);
        assert_eq!(hash.latest_producer(&KEY, 0).unwrap().id, 1);
        assert_eq!(hash.latest_producer(&KEY, 1).unwrap().id, 1);
        assert_eq!(hash.latest_producer(&KEY, 5).unwrap().id, 2);
        hash.clear();
        assert!(hash.latest_producer(&KEY, 5).is_none());
        assert_eq!(hash.len(), 0);
    }

    #[test]
    fn input_at_earlier_phase() {
        let hash = DepHash::new(2);
        let w0 = task(1, 0);
        let w1 = task(2, 1);
        hash.add_output(&w0, KEY);
        hash.add_output(&w1, KEY);
        let old = task(3, 1);
        hash.add_input(&old, KEY, 0);
        // only the phase 0 writer
        assert_eq!(old.num_unresolved(), 1);
        w0.close(TaskState::Done);
        let before = task(4, 1);
        hash.add_input(&before, KEY, 0);
        assert_eq!(before.num_unresolved(), 0);
        let current = task(5, 1);
        hash.add_input(&current, KEY, 1);
        assert_eq!(current.num_unresolved(), 1);
    }

    #[test]
    fn finished_writers_are_pruned() {
        let hash = DepHash::new(1);
        for id in 1..=10 {
            let writer = task(id, 0);
            hash.add_output(&writer, KEY);
            writer.close(TaskState::Done);
        }
        assert_eq!(hash.num_producers(&KEY), 1);
        let pending = task(11, 0);
        hash.add_output(&pending, KEY);
        let next = task(12, 0);
        hash.add_output(&next, KEY);
        assert_eq!(hash.num_producers(&KEY), 2);
        assert_eq!(hash.latest_producer(&KEY, 0).unwrap().id, 12);
    }
}
