use crate::error::{DartError, DartResult};

use serde::{Deserialize, Serialize};

/// How the indices of one dimension are dealt out to the units along that dimension
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Distribution {
    /// Not distributed, the whole dimension lives at unit coordinate 0
    None,
    /// One block of `ceil(extent / units)` indices per unit
    Blocked,
    /// Round robin, one index at a time
    Cyclic,
    /// Round robin over blocks of the given size
    BlockCyclic(usize),
    /// Like [Distribution::BlockCyclic], but each block is stored contiguously
    Tile(usize),
}

impl Distribution {
    pub fn is_distributed(&self) -> bool {
        !matches!(self, Distribution::None)
    }

    pub fn is_tiled(&self) -> bool {
        matches!(self, Distribution::Tile(_))
    }
}

/// The mapping of a single dimension, derived from its extent, distribution and the
/// number of units along it
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct DimMapping {
    pub(crate) extent: usize,
    pub(crate) units: usize,
    pub(crate) block_size: usize,
    pub(crate) num_blocks: usize,
}

impl DimMapping {
    pub(crate) fn new(dist: Distribution, extent: usize, units: usize) -> DartResult<DimMapping> {
        if extent == 0 || units == 0 {
            return Err(DartError::Inval);
        }
        let block_size = match dist {
            Distribution::None => {
                if units != 1 {
                    return Err(DartError::Inval);
                }
                extent
            }
            Distribution::Blocked => (extent + units - 1) / units,
            Distribution::Cyclic => 1,
            Distribution::BlockCyclic(b) | Distribution::Tile(b) => {
                if b == 0 {
                    return Err(DartError::Inval);
                }
                b
            }
        };
        Ok(DimMapping {
            extent,
            units,
            block_size,
            num_blocks: (extent + block_size - 1) / block_size,
        })
    }

    pub(crate) fn unit_coord(&self, i: usize) -> usize {
        (i / self.block_size) % self.units
    }

    pub(crate) fn local_index(&self, i: usize) -> usize {
        (i / (self.block_size * self.units)) * self.block_size + i % self.block_size
    }

    pub(crate) fn block_coord(&self, i: usize) -> usize {
        i / self.block_size
    }

    /// Extent of block `k`, only the last block may be short
    pub(crate) fn block_extent(&self, k: usize) -> usize {
        let start = k * self.block_size;
        self.block_size.min(self.extent.saturating_sub(start))
    }

    /// Indices held by unit coordinate `u`
    pub(crate) fn local_extent(&self, u: usize) -> usize {
        if u >= self.num_blocks {
            return 0;
        }
        let owned = (self.num_blocks - 1 - u) / self.units + 1;
        let last = self.num_blocks - 1;
        let short = if last % self.units == u {
            self.block_size - self.block_extent(last)
        } else {
            0
        };
        owned * self.block_size - short
    }

    /// Same at every unit coordinate: the storage for the largest share
    pub(crate) fn capacity(&self) -> usize {
        (self.num_blocks + self.units - 1) / self.units * self.block_size
    }

    /// Global index of local index `l` at unit coordinate `u`
    pub(crate) fn global_index(&self, u: usize, l: usize) -> DartResult<usize> {
        if u >= self.units || l >= self.local_extent(u) {
            return Err(DartError::Inval);
        }
        let block = (l / self.block_size) * self.units + u;
        Ok(block * self.block_size + l % self.block_size)
    }

    /// Every unit coordinate holds exactly its capacity
    pub(crate) fn is_balanced(&self) -> bool {
        self.extent % (self.block_size * self.units) == 0
    }
}
