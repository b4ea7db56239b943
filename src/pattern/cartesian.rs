use crate::error::{DartError, DartResult};

use serde::{Deserialize, Serialize};

/// Order in which multi-dimensional coordinates are linearized
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum MemoryOrder {
    /// The last dimension is contiguous
    #[default]
    RowMajor,
    /// The first dimension is contiguous
    ColMajor,
}

impl MemoryOrder {
    /// Dimension with stride one in an `n`-dimensional space
    pub fn fastest_dim(&self, n: usize) -> usize {
        match self {
            MemoryOrder::RowMajor => n.saturating_sub(1),
            MemoryOrder::ColMajor => 0,
        }
    }

    /// Dimensions from the slowest to the fastest varying one
    pub(crate) fn dims_slow_to_fast(&self, n: usize) -> impl Iterator<Item = usize> {
        let order = *self;
        (0..n).map(move |i| match order {
            MemoryOrder::RowMajor => i,
            MemoryOrder::ColMajor => n - 1 - i,
        })
    }
}

/// An `N`-dimensional rectangle of indices `[0, extents[d])` with a linearization order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CartesianIndexSpace<const N: usize> {
    extents: [usize; N],
    order: MemoryOrder,
}

impl<const N: usize> CartesianIndexSpace<N> {
    pub fn new(extents: [usize; N], order: MemoryOrder) -> CartesianIndexSpace<N> {
        CartesianIndexSpace { extents, order }
    }

    pub fn extents(&self) -> [usize; N] {
        self.extents
    }

    pub fn order(&self) -> MemoryOrder {
        self.order
    }

    /// Number of points, zero if any extent is zero
    pub fn size(&self) -> usize {
        self.extents.iter().product()
    }

    pub fn contains(&self, coords: &[usize; N]) -> bool {
        coords.iter().zip(self.extents.iter()).all(|(c, e)| c < e)
    }

    pub fn linearize(&self, coords: &[usize; N]) -> DartResult<usize> {
        if !self.contains(coords) {
            return Err(DartError::Inval);
        }
        Ok(self
            .order
            .dims_slow_to_fast(N)
            .fold(0, |acc, d| acc * self.extents[d] + coords[d]))
    }

    pub fn delinearize(&self, mut index: usize) -> DartResult<[usize; N]> {
        if index >= self.size() {
            return Err(DartError::Inval);
        }
        let mut coords = [0; N];
        let dims: Vec<usize> = self.order.dims_slow_to_fast(N).collect();
        for &d in dims.iter().rev() {
            coords[d] = index % self.extents[d];
            index /= self.extents[d];
        }
        Ok(coords)
    }

    /// Every point in linearization order
    pub fn iter(self) -> impl Iterator<Item = [usize; N]> {
        (0..self.size()).filter_map(move |i| self.delinearize(i).ok())
    }
}
