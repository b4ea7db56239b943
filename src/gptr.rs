//! 128-bit global pointers.
//!
//! Layout (least significant bit first):
//!
//! | bits    | field                                                      |
//! |---------|------------------------------------------------------------|
//! | 0..64   | local address (segment 0) or offset into the segment       |
//! | 64..80  | team id                                                    |
//! | 80..96  | segment id                                                 |
//! | 96..127 | unit id, relative to the team for collective segments      |
//! | 127     | flag bit                                                   |
//!
//! The null pointer is all zeros. Two pointers are equal iff their bits are equal.

use crate::error::{DartError, DartResult};
use crate::team::TeamId;

use serde::{Deserialize, Serialize};

const UNIT_BITS: u32 = 31;
const MAX_UNIT: u64 = (1 << UNIT_BITS) - 1;

/// A reference to a byte anywhere in the partitioned global address space
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GlobalPtr {
    unit: u32,
    flags: u8,
    segid: i16,
    teamid: u16,
    addr_or_offs: u64,
}

impl GlobalPtr {
    /// The null pointer
    pub const NULL: GlobalPtr = GlobalPtr {
        unit: 0,
        flags: 0,
        segid: 0,
        teamid: 0,
        addr_or_offs: 0,
    };

    pub(crate) fn new(unit: usize, team: TeamId, segid: i16, addr_or_offs: u64) -> GlobalPtr {
        debug_assert!(unit as u64 <= MAX_UNIT);
        GlobalPtr {
            unit: unit as u32,
            flags: 0,
            segid,
            teamid: team.0,
            addr_or_offs,
        }
    }

    pub fn is_null(&self) -> bool {
        *self == GlobalPtr::NULL
    }

    /// The unit owning the referenced memory, relative to [GlobalPtr::team_id]
    pub fn unit(&self) -> usize {
        self.unit as usize
    }

    pub fn team_id(&self) -> TeamId {
        TeamId(self.teamid)
    }

    /// Segment 0 holds non-collective allocations, positive ids are collective segments
    pub fn segment_id(&self) -> i16 {
        self.segid
    }

    /// The local address (segment 0) or the byte offset into the segment
    pub fn addr_or_offset(&self) -> u64 {
        self.addr_or_offs
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u8) -> DartResult<()> {
        if flags > 1 {
            return Err(DartError::Inval);
        }
        self.flags = flags;
        Ok(())
    }

    /// Point at the same offset in another unit's part of the segment
    pub fn set_unit(&mut self, unit: usize) -> DartResult<()> {
        if unit as u64 > MAX_UNIT {
            return Err(DartError::Inval);
        }
        self.unit = unit as u32;
        Ok(())
    }

    /// Move the pointer by `delta` bytes within the owning unit's memory
    pub fn inc_addr(&mut self, delta: i64) -> DartResult<()> {
        self.addr_or_offs = self
            .addr_or_offs
            .checked_add_signed(delta)
            .ok_or(DartError::Inval)?;
        Ok(())
    }

    /// Copy of this pointer moved by `delta` bytes
    pub fn offset_by(&self, delta: i64) -> DartResult<GlobalPtr> {
        let mut gptr = *self;
        gptr.inc_addr(delta)?;
        Ok(gptr)
    }

    /// Copy of this pointer referencing `unit`
    pub fn with_unit(&self, unit: usize) -> DartResult<GlobalPtr> {
        let mut gptr = *self;
        gptr.set_unit(unit)?;
        Ok(gptr)
    }

    pub fn to_bits(&self) -> u128 {
        (self.addr_or_offs as u128)
            | ((self.teamid as u128) << 64)
            | ((self.segid as u16 as u128) << 80)
            | ((self.unit as u128) << 96)
            | ((self.flags as u128 & 1) << 127)
    }

    pub fn from_bits(bits: u128) -> GlobalPtr {
        GlobalPtr {
            addr_or_offs: bits as u64,
            teamid: (bits >> 64) as u16,
            segid: (bits >> 80) as u16 as i16,
            unit: ((bits >> 96) as u64 & MAX_UNIT) as u32,
            flags: (bits >> 127) as u8,
        }
    }
}

impl std::fmt::Debug for GlobalPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "gptr(unit: {}, team: {}, seg: {}, offs: {:#x}, flags: {})",
            self.unit, self.teamid, self.segid, self.addr_or_offs, self.flags
        )
    }
}

impl std::fmt::Display for GlobalPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.to_bits())
    }
}
