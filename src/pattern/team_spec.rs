use super::cartesian::{CartesianIndexSpace, MemoryOrder};
use super::distribution::Distribution;
use crate::error::{DartError, DartResult};

/// Arrangement of a team's units in an `N`-dimensional grid.
///
/// The team-relative id of a unit is its rank in the grid under the grid's own order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TeamSpec<const N: usize> {
    grid: CartesianIndexSpace<N>,
}

impl<const N: usize> TeamSpec<N> {
    pub fn new(extents: [usize; N], order: MemoryOrder) -> DartResult<TeamSpec<N>> {
        if N == 0 || extents.iter().any(|&e| e == 0) {
            return Err(DartError::Inval);
        }
        Ok(TeamSpec {
            grid: CartesianIndexSpace::new(extents, order),
        })
    }

    /// All units along the first distributed dimension
    pub fn linear(num_units: usize, dists: &[Distribution; N]) -> DartResult<TeamSpec<N>> {
        let mut extents = [1; N];
        match dists.iter().position(|d| d.is_distributed()) {
            Some(d) => extents[d] = num_units,
            None if num_units == 1 => {}
            None => return Err(DartError::Inval),
        }
        TeamSpec::new(extents, MemoryOrder::RowMajor)
    }

    /// Spread `num_units` as evenly as possible over the distributed dimensions:
    /// prime factors, largest first, go to the distributed dimension with the
    /// smallest extent so far.
    pub fn balanced(num_units: usize, dists: &[Distribution; N]) -> DartResult<TeamSpec<N>> {
        if num_units == 0 {
            return Err(DartError::Inval);
        }
        let distributed: Vec<usize> = (0..N).filter(|&d| dists[d].is_distributed()).collect();
        if distributed.is_empty() {
            return TeamSpec::linear(num_units, dists);
        }
        let mut extents = [1; N];
        for factor in prime_factors(num_units).into_iter().rev() {
            let target = distributed
                .iter()
                .copied()
                .min_by_key(|&d| extents[d])
                .unwrap_or(distributed[0]);
            extents[target] *= factor;
        }
        TeamSpec::new(extents, MemoryOrder::RowMajor)
    }

    pub fn extents(&self) -> [usize; N] {
        self.grid.extents()
    }

    pub fn extent(&self, dim: usize) -> usize {
        self.grid.extents()[dim]
    }

    pub fn order(&self) -> MemoryOrder {
        self.grid.order()
    }

    /// Units in the grid
    pub fn size(&self) -> usize {
        self.grid.size()
    }

    pub fn unit_at(&self, coords: &[usize; N]) -> DartResult<usize> {
        self.grid.linearize(coords)
    }

    pub fn coords(&self, unit: usize) -> DartResult<[usize; N]> {
        self.grid.delinearize(unit)
    }
}

fn prime_factors(mut n: usize) -> Vec<usize> {
    let mut factors = Vec::new();
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    factors
}
