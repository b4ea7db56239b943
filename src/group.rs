//! Ordered sets of global unit ids.
use crate::error::{DartError, DartResult};

use serde::{Deserialize, Serialize};

/// A set of distinct global unit ids, kept sorted ascending
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct Group {
    members: Vec<usize>,
}

impl Group {
    /// The empty group
    pub fn new() -> Group {
        Group {
            members: Vec::new(),
        }
    }

    /// The group `{0, .., num_units-1}`
    pub fn all(num_units: usize) -> Group {
        Group {
            members: (0..num_units).collect(),
        }
    }

    pub fn from_units(units: impl IntoIterator<Item = usize>) -> Group {
        let mut members: Vec<usize> = units.into_iter().collect();
        members.sort_unstable();
        members.dedup();
        Group { members }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in ascending order
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn is_member(&self, unit: usize) -> bool {
        self.members.binary_search(&unit).is_ok()
    }

    /// Position of global `unit` inside the group
    pub fn rank_of(&self, unit: usize) -> Option<usize> {
        self.members.binary_search(&unit).ok()
    }

    /// Global id of the member at position `rank`
    pub fn unit_at(&self, rank: usize) -> DartResult<usize> {
        self.members.get(rank).copied().ok_or(DartError::Inval)
    }

    pub fn add_member(&mut self, unit: usize) {
        if let Err(pos) = self.members.binary_search(&unit) {
            self.members.insert(pos, unit);
        }
    }

    pub fn del_member(&mut self, unit: usize) -> DartResult<()> {
        match self.members.binary_search(&unit) {
            Ok(pos) => {
                self.members.remove(pos);
                Ok(())
            }
            Err(_) => Err(DartError::NotFound),
        }
    }

    pub fn union(&self, other: &Group) -> Group {
        let mut members = Vec::with_capacity(self.size() + other.size());
        let (mut i, mut j) = (0, 0);
        while i < self.members.len() && j < other.members.len() {
            let (a, b) = (self.members[i], other.members[j]);
            if a < b {
                members.push(a);
                i += 1;
            } else if b < a {
                members.push(b);
                j += 1;
            } else {
                members.push(a);
                i += 1;
                j += 1;
            }
        }
        members.extend_from_slice(&self.members[i..]);
        members.extend_from_slice(&other.members[j..]);
        Group { members }
    }

    pub fn intersect(&self, other: &Group) -> Group {
        Group {
            members: self
                .members
                .iter()
                .copied()
                .filter(|u| other.is_member(*u))
                .collect(),
        }
    }

    pub fn difference(&self, other: &Group) -> Group {
        Group {
            members: self
                .members
                .iter()
                .copied()
                .filter(|u| !other.is_member(*u))
                .collect(),
        }
    }

    /// Split into `n` groups of consecutive members whose sizes differ by at most one.
    /// Trailing groups are empty when there are fewer members than `n`.
    pub fn split(&self, n: usize) -> DartResult<Vec<Group>> {
        if n == 0 {
            return Err(DartError::Inval);
        }
        let base = self.size() / n;
        let extra = self.size() % n;
        let mut start = 0;
        let mut groups = Vec::with_capacity(n);
        for i in 0..n {
            let len = base + (i < extra) as usize;
            groups.push(Group {
                members: self.members[start..start + len].to_vec(),
            });
            start += len;
        }
        Ok(groups)
    }
}
