//! Translation table from segment ids to the per-unit memory backing them.
use crate::error::{DartError, DartResult};

use std::collections::BTreeMap;

/// Id of the segment holding non-collective allocations
pub const LOCAL_SEGMENT: i16 = 0;

/// One collective allocation as seen by one member of the team
#[derive(Debug, Clone)]
pub(crate) struct SegmentEntry {
    pub(crate) segid: i16,
    /// bytes allocated at every member
    pub(crate) size: usize,
    /// base address of every member's part, indexed by team-relative unit id
    pub(crate) bases: Vec<usize>,
    /// base address of the calling unit's part
    pub(crate) local_addr: usize,
}

impl SegmentEntry {
    /// Absolute address of `offset` within `rank`'s part, checking `len` bytes fit
    pub(crate) fn addr(&self, rank: usize, offset: u64, len: usize) -> DartResult<usize> {
        let base = *self.bases.get(rank).ok_or(DartError::Inval)?;
        let offset = usize::try_from(offset).map_err(|_| DartError::Inval)?;
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(base + offset),
            _ => Err(DartError::Inval),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SegmentTable {
    entries: BTreeMap<i16, SegmentEntry>,
}

impl SegmentTable {
    pub(crate) fn new() -> SegmentTable {
        SegmentTable {
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, entry: SegmentEntry) -> DartResult<()> {
        if entry.segid <= LOCAL_SEGMENT || self.entries.contains_key(&entry.segid) {
            return Err(DartError::Inval);
        }
        self.entries.insert(entry.segid, entry);
        Ok(())
    }

    pub(crate) fn get(&self, segid: i16) -> DartResult<&SegmentEntry> {
        self.entries.get(&segid).ok_or(DartError::NotFound)
    }

    pub(crate) fn remove(&mut self, segid: i16) -> DartResult<SegmentEntry> {
        self.entries.remove(&segid).ok_or(DartError::NotFound)
    }

    pub(crate) fn drain(&mut self) -> Vec<SegmentEntry> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(segid: i16) -> SegmentEntry {
        SegmentEntry {
            segid,
            size: 64,
            bases: vec![1000, 2000],
            local_addr: 2000,
        }
    }

    #[test]
    fn insert_lookup_remove() {
        let mut table = SegmentTable::new();
        table.insert(entry(1)).unwrap();
        assert_eq!(table.insert(entry(1)), Err(DartError::Inval));
        assert_eq!(table.insert(entry(0)), Err(DartError::Inval));
        assert_eq!(table.get(1).unwrap().addr(0, 8, 8), Ok(1008));
        assert_eq!(table.get(1).unwrap().addr(1, 60, 8), Err(DartError::Inval));
        assert_eq!(table.get(1).unwrap().addr(2, 0, 1), Err(DartError::Inval));
        table.remove(1).unwrap();
        assert_eq!(table.get(1).map(|e| e.segid), Err(DartError::NotFound));
        assert_eq!(table.len(), 0);
    }
}
