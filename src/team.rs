//! Teams: ordered groups of units with their own id, collective context and segments.
//!
//! The teams a unit belongs to live in an arena owned by the unit's [Dart] context,
//! looked up by their 16-bit [TeamId]. Team-relative unit ids are positions in the
//! team's (ascending) group.

use crate::dart_world::Dart;
use crate::datatype::{as_bytes, as_bytes_mut, DartDatatype, DartOp};
use crate::error::{DartError, DartResult};
use crate::group::Group;
use crate::segment::SegmentTable;
use crate::transport::{CollGroup, CommMem};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identifier of a team, unique among the teams a unit is a member of
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct TeamId(pub(crate) u16);

/// The team containing every unit
pub const DART_TEAM_ALL: TeamId = TeamId(0);

impl TeamId {
    pub fn id(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for TeamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "team {}", self.0)
    }
}

pub(crate) struct TeamData {
    pub(crate) id: TeamId,
    pub(crate) parent: Option<TeamId>,
    pub(crate) group: Group,
    /// team-relative id of the calling unit
    pub(crate) my_rank: usize,
    pub(crate) coll: CollGroup,
    pub(crate) segments: RwLock<SegmentTable>,
    pub(crate) next_segid: Mutex<i16>,
}

impl TeamData {
    pub(crate) fn new(
        id: TeamId,
        parent: Option<TeamId>,
        group: Group,
        my_unit: usize,
        key: u64,
    ) -> DartResult<TeamData> {
        let my_rank = group.rank_of(my_unit).ok_or(DartError::Inval)?;
        let members = Arc::new(group.members().to_vec());
        Ok(TeamData {
            id,
            parent,
            my_rank,
            coll: CollGroup {
                key,
                members,
                my_index: my_rank,
            },
            group,
            segments: RwLock::new(SegmentTable::new()),
            next_segid: Mutex::new(1),
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.group.size()
    }

    /// Global id of team-relative `rank`
    pub(crate) fn global_unit(&self, rank: usize) -> DartResult<usize> {
        self.group.unit_at(rank)
    }

    /// Collective key of a child team, identical at every member
    pub(crate) fn child_key(&self, child: TeamId) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.coll.key.hash(&mut hasher);
        child.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Default)]
struct TeamArena {
    slots: Vec<Option<Arc<TeamData>>>,
    index: HashMap<TeamId, usize>,
}

/// The teams the calling unit belongs to
pub(crate) struct TeamRegistry {
    arena: RwLock<TeamArena>,
    next_team_id: Mutex<u16>,
}

impl TeamRegistry {
    pub(crate) fn new() -> TeamRegistry {
        TeamRegistry {
            arena: RwLock::new(TeamArena::default()),
            next_team_id: Mutex::new(1),
        }
    }

    pub(crate) fn get(&self, id: TeamId) -> DartResult<Arc<TeamData>> {
        let arena = self.arena.read();
        match arena.index.get(&id) {
            Some(slot) => arena.slots[*slot].clone().ok_or(DartError::NotFound),
            None => Err(DartError::NotFound),
        }
    }

    pub(crate) fn insert(&self, team: TeamData) -> DartResult<Arc<TeamData>> {
        let mut arena = self.arena.write();
        if arena.index.contains_key(&team.id) {
            return Err(DartError::Inval);
        }
        let team = Arc::new(team);
        let slot = match arena.slots.iter().position(|s| s.is_none()) {
            Some(slot) => {
                arena.slots[slot] = Some(team.clone());
                slot
            }
            None => {
                arena.slots.push(Some(team.clone()));
                arena.slots.len() - 1
            }
        };
        arena.index.insert(team.id, slot);
        Ok(team)
    }

    pub(crate) fn remove(&self, id: TeamId) -> DartResult<Arc<TeamData>> {
        let mut arena = self.arena.write();
        let slot = arena.index.remove(&id).ok_or(DartError::NotFound)?;
        arena.slots[slot].take().ok_or(DartError::NotFound)
    }

    /// Ids of every live team, children before their parents
    pub(crate) fn ids_leaf_first(&self) -> Vec<TeamId> {
        let arena = self.arena.read();
        let mut ids: Vec<TeamId> = arena.index.keys().copied().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids
    }

    pub(crate) fn next_team_id(&self) -> u16 {
        *self.next_team_id.lock()
    }

    pub(crate) fn set_next_team_id(&self, id: u16) {
        *self.next_team_id.lock() = id;
    }
}

impl Dart {
    pub(crate) fn team_data(&self, team: TeamId) -> DartResult<Arc<TeamData>> {
        self.check_active()?;
        self.inner.teams.get(team)
    }

    /// Create a team from the members of `group`.
    ///
    /// Collective over `parent`: every member of the parent calls it with the same group.
    /// Members of `group` receive the new id, every other caller receives `None`.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn team_create(&self, parent: TeamId, group: &Group) -> DartResult<Option<TeamId>> {
        let parent_data = self.team_data(parent)?;
        if group.difference(&parent_data.group).size() > 0 {
            return Err(DartError::Inval);
        }
        let next = self.inner.teams.next_team_id() as u64;
        let mut max = 0u64;
        self.inner.comm.allreduce(
            &parent_data.coll,
            as_bytes(&[next]),
            as_bytes_mut(std::slice::from_mut(&mut max)),
            DartOp::Max,
            DartDatatype::ULong,
        )?;
        if max >= u16::MAX as u64 {
            tracing::error!("team ids exhausted");
            return Err(DartError::Other);
        }
        self.inner.teams.set_next_team_id(max as u16 + 1);
        let id = TeamId(max as u16);
        if !group.is_member(self.my_unit()) {
            tracing::debug!("unit {} not part of new {}", self.my_unit(), id);
            return Ok(None);
        }
        let team = TeamData::new(
            id,
            Some(parent),
            group.clone(),
            self.my_unit(),
            parent_data.child_key(id),
        )?;
        self.inner.teams.insert(team)?;
        tracing::debug!("unit {} created {} with {:?}", self.my_unit(), id, group);
        Ok(Some(id))
    }

    /// Destroy a team, collective over its members. Fails with [DartError::Inval] while
    /// segments are still allocated on the team.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn team_destroy(&self, team: TeamId) -> DartResult<()> {
        if team == DART_TEAM_ALL {
            return Err(DartError::Inval);
        }
        let data = self.team_data(team)?;
        let live = data.segments.read().len();
        if live > 0 {
            tracing::warn!("{} still has {live} segments allocated", team);
            return Err(DartError::Inval);
        }
        self.inner.comm.barrier(&data.coll)?;
        self.release_team(team)
    }

    pub(crate) fn release_team(&self, team: TeamId) -> DartResult<()> {
        let data = self.inner.teams.remove(team)?;
        let leaked = data.segments.write().drain();
        for entry in leaked {
            tracing::debug!(
                "unit {} freeing segment {} of destroyed {}",
                self.my_unit(),
                entry.segid,
                team
            );
            self.inner.comm.free(entry.local_addr)?;
        }
        Ok(())
    }

    /// Split `parent` into `n` teams of consecutive units, collective over `parent`.
    /// Returns the team the caller ended up in.
    pub fn team_split(&self, parent: TeamId, n: usize) -> DartResult<Option<TeamId>> {
        let parent_data = self.team_data(parent)?;
        let mut mine = None;
        for group in parent_data.group.split(n)? {
            if let Some(id) = self.team_create(parent, &group)? {
                mine = Some(id);
            }
        }
        Ok(mine)
    }

    /// Team-relative id of the calling unit
    pub fn team_myid(&self, team: TeamId) -> DartResult<usize> {
        Ok(self.team_data(team)?.my_rank)
    }

    pub fn team_size(&self, team: TeamId) -> DartResult<usize> {
        Ok(self.team_data(team)?.size())
    }

    pub fn team_get_group(&self, team: TeamId) -> DartResult<Group> {
        Ok(self.team_data(team)?.group.clone())
    }

    pub fn team_parent(&self, team: TeamId) -> DartResult<Option<TeamId>> {
        Ok(self.team_data(team)?.parent)
    }

    /// Global id of team-relative unit `rank`
    pub fn team_unit_l2g(&self, team: TeamId, rank: usize) -> DartResult<usize> {
        self.team_data(team)?.global_unit(rank)
    }

    /// Team-relative id of global `unit`
    pub fn team_unit_g2l(&self, team: TeamId, unit: usize) -> DartResult<usize> {
        self.team_data(team)?
            .group
            .rank_of(unit)
            .ok_or(DartError::NotFound)
    }

    /// The next team id this unit would propose
    pub fn next_avail_team_id(&self) -> u16 {
        self.inner.teams.next_team_id()
    }
}
