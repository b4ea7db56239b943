//! Patterns: how an `N`-dimensional index space is distributed over the units of a team.
//!
//! A [Pattern] is an immutable value derived from its extents, one [Distribution] per
//! dimension, a [TeamSpec] arranging the team's units and a [MemoryOrder]. Every
//! mapping is computed per dimension and composed, so each call is `O(N)`.
//!
//! Local storage at a unit is the dense array of the elements it owns, linearized in
//! the pattern's memory order over the unit's local extents. Tiled patterns store
//! every tile contiguously instead, tiles following each other in memory order.
mod cartesian;
mod distribution;
mod team_spec;

pub use cartesian::{CartesianIndexSpace, MemoryOrder};
pub use distribution::Distribution;
pub use team_spec::TeamSpec;

use crate::dart_world::Dart;
use crate::error::{DartError, DartResult};
use crate::team::TeamId;
use distribution::DimMapping;

/// A maximal rectangle of elements owned by one unit, stored contiguously along the
/// fastest dimension
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Block<const N: usize> {
    /// block coordinates of this block
    pub coords: [usize; N],
    /// team-relative owner
    pub unit: usize,
    /// global coordinates of the first element
    pub offset: [usize; N],
    pub extent: [usize; N],
    /// local offset of the first element at `unit`
    pub local_offset: usize,
}

impl<const N: usize> Block<N> {
    pub fn size(&self) -> usize {
        self.extent.iter().product()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Pattern<const N: usize> {
    team: TeamId,
    space: CartesianIndexSpace<N>,
    dists: [Distribution; N],
    teamspec: TeamSpec<N>,
    dims: [DimMapping; N],
    tiled: bool,
}

impl<const N: usize> Pattern<N> {
    /// Validate and derive a pattern. Rejects zero extents, a [Distribution::None]
    /// dimension spread over more than one unit, zero block sizes, and tiled patterns
    /// mixing tiles with other distributions or with extents not divisible by the tile.
    pub fn new(
        team: TeamId,
        extents: [usize; N],
        dists: [Distribution; N],
        teamspec: TeamSpec<N>,
        order: MemoryOrder,
    ) -> DartResult<Pattern<N>> {
        if N == 0 {
            return Err(DartError::Inval);
        }
        let mut dims = [DimMapping::new(Distribution::None, 1, 1)?; N];
        for d in 0..N {
            dims[d] = DimMapping::new(dists[d], extents[d], teamspec.extent(d))?;
        }
        let tiled = dists.iter().any(|d| d.is_tiled());
        if tiled {
            for d in 0..N {
                let tile_ok = match dists[d] {
                    Distribution::Tile(b) => extents[d] % b == 0,
                    Distribution::None => true,
                    _ => false,
                };
                if !tile_ok {
                    return Err(DartError::Inval);
                }
            }
        }
        Ok(Pattern {
            team,
            space: CartesianIndexSpace::new(extents, order),
            dists,
            teamspec,
            dims,
            tiled,
        })
    }

    pub fn team(&self) -> TeamId {
        self.team
    }

    pub fn extents(&self) -> [usize; N] {
        self.space.extents()
    }

    pub fn distributions(&self) -> [Distribution; N] {
        self.dists
    }

    pub fn team_spec(&self) -> &TeamSpec<N> {
        &self.teamspec
    }

    pub fn memory_order(&self) -> MemoryOrder {
        self.space.order()
    }

    pub fn num_units(&self) -> usize {
        self.teamspec.size()
    }

    /// Total number of elements
    pub fn size(&self) -> usize {
        self.space.size()
    }

    pub fn block_extents(&self) -> [usize; N] {
        self.dims.map(|m| m.block_size)
    }

    pub fn blocks_per_dim(&self) -> [usize; N] {
        self.dims.map(|m| m.num_blocks)
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks_per_dim().iter().product()
    }

    fn check_coords(&self, coords: &[usize; N]) -> DartResult<()> {
        if self.space.contains(coords) {
            Ok(())
        } else {
            Err(DartError::Inval)
        }
    }

    fn check_unit(&self, unit: usize) -> DartResult<[usize; N]> {
        self.teamspec.coords(unit)
    }

    /// Coordinates of a linear global index
    pub fn coords(&self, index: usize) -> DartResult<[usize; N]> {
        self.space.delinearize(index)
    }

    /// Linear global index of `coords`
    pub fn global_at(&self, coords: &[usize; N]) -> DartResult<usize> {
        self.space.linearize(coords)
    }

    /// Team-relative unit owning `coords`
    pub fn unit_at(&self, coords: &[usize; N]) -> DartResult<usize> {
        self.check_coords(coords)?;
        let mut ucoords = [0; N];
        for d in 0..N {
            ucoords[d] = self.dims[d].unit_coord(coords[d]);
        }
        self.teamspec.unit_at(&ucoords)
    }

    /// Per-dimension local coordinates of `coords` at its owner
    pub fn local_coords(&self, coords: &[usize; N]) -> DartResult<[usize; N]> {
        self.check_coords(coords)?;
        let mut lcoords = [0; N];
        for d in 0..N {
            lcoords[d] = self.dims[d].local_index(coords[d]);
        }
        Ok(lcoords)
    }

    /// Owner of `coords` and the offset of the element in the owner's local storage
    pub fn local_at(&self, coords: &[usize; N]) -> DartResult<(usize, usize)> {
        let unit = self.unit_at(coords)?;
        let lcoords = self.local_coords(coords)?;
        Ok((unit, self.local_offset(unit, &lcoords)?))
    }

    /// Elements held by `unit` along each dimension
    pub fn local_extents(&self, unit: usize) -> DartResult<[usize; N]> {
        let ucoords = self.check_unit(unit)?;
        let mut extents = [0; N];
        for d in 0..N {
            extents[d] = self.dims[d].local_extent(ucoords[d]);
        }
        Ok(extents)
    }

    /// Elements held by `unit`, may be zero
    pub fn local_size(&self, unit: usize) -> DartResult<usize> {
        Ok(self.local_extents(unit)?.iter().product())
    }

    /// Storage needed at every unit, the same for all of them and at least
    /// [Pattern::local_size] of any unit
    pub fn local_capacity(&self) -> usize {
        self.dims.iter().map(|m| m.capacity()).product()
    }

    /// Whether every unit holds exactly [Pattern::local_capacity] elements
    pub fn is_balanced(&self) -> bool {
        self.dims.iter().all(|m| m.is_balanced())
    }

    /// Whether `unit` owns the element at linear global `index`
    pub fn is_local(&self, index: usize, unit: usize) -> DartResult<bool> {
        self.check_unit(unit)?;
        Ok(self.unit_at(&self.coords(index)?)? == unit)
    }

    fn local_offset(&self, unit: usize, lcoords: &[usize; N]) -> DartResult<usize> {
        let lext = self.local_extents(unit)?;
        let order = self.memory_order();
        if !self.tiled {
            return CartesianIndexSpace::new(lext, order).linearize(lcoords);
        }
        let bs = self.block_extents();
        let mut tile = [0; N];
        let mut within = [0; N];
        let mut tiles = [0; N];
        for d in 0..N {
            tile[d] = lcoords[d] / bs[d];
            within[d] = lcoords[d] % bs[d];
            tiles[d] = lext[d] / bs[d];
        }
        let t = CartesianIndexSpace::new(tiles, order).linearize(&tile)?;
        let w = CartesianIndexSpace::new(bs, order).linearize(&within)?;
        Ok(t * bs.iter().product::<usize>() + w)
    }

    /// Per-dimension local coordinates of the element at `local_index` of `unit`
    fn local_index_coords(&self, unit: usize, local_index: usize) -> DartResult<[usize; N]> {
        let lext = self.local_extents(unit)?;
        let order = self.memory_order();
        if !self.tiled {
            return CartesianIndexSpace::new(lext, order).delinearize(local_index);
        }
        let bs = self.block_extents();
        let vol: usize = bs.iter().product();
        let tiles = {
            let mut tiles = [0; N];
            for d in 0..N {
                tiles[d] = lext[d] / bs[d];
            }
            tiles
        };
        let tile = CartesianIndexSpace::new(tiles, order).delinearize(local_index / vol)?;
        let within = CartesianIndexSpace::new(bs, order).delinearize(local_index % vol)?;
        let mut lcoords = [0; N];
        for d in 0..N {
            lcoords[d] = tile[d] * bs[d] + within[d];
        }
        Ok(lcoords)
    }

    /// Global coordinates of the element at per-dimension local coordinates of `unit`
    pub fn global_coords(&self, unit: usize, lcoords: &[usize; N]) -> DartResult<[usize; N]> {
        let ucoords = self.check_unit(unit)?;
        let mut coords = [0; N];
        for d in 0..N {
            coords[d] = self.dims[d].global_index(ucoords[d], lcoords[d])?;
        }
        Ok(coords)
    }

    /// Linear global index of the element at `local_index` of `unit`
    pub fn global(&self, unit: usize, local_index: usize) -> DartResult<usize> {
        let lcoords = self.local_index_coords(unit, local_index)?;
        self.global_at(&self.global_coords(unit, &lcoords)?)
    }

    /// The block with the given block coordinates
    pub fn block(&self, bcoords: &[usize; N]) -> DartResult<Block<N>> {
        let mut offset = [0; N];
        let mut extent = [0; N];
        for d in 0..N {
            if bcoords[d] >= self.dims[d].num_blocks {
                return Err(DartError::Inval);
            }
            offset[d] = bcoords[d] * self.dims[d].block_size;
            extent[d] = self.dims[d].block_extent(bcoords[d]);
        }
        let (unit, local_offset) = self.local_at(&offset)?;
        Ok(Block {
            coords: *bcoords,
            unit,
            offset,
            extent,
            local_offset,
        })
    }

    /// The block containing the element at `coords`
    pub fn block_at(&self, coords: &[usize; N]) -> DartResult<Block<N>> {
        self.check_coords(coords)?;
        let mut bcoords = [0; N];
        for d in 0..N {
            bcoords[d] = self.dims[d].block_coord(coords[d]);
        }
        self.block(&bcoords)
    }

    /// Every block, in the pattern's memory order over block coordinates
    pub fn blocks(&self) -> impl Iterator<Item = Block<N>> + '_ {
        let grid = CartesianIndexSpace::new(self.blocks_per_dim(), self.memory_order());
        (0..grid.size()).filter_map(move |i| {
            let bcoords = grid.delinearize(i).ok()?;
            self.block(&bcoords).ok()
        })
    }
}

impl Pattern<1> {
    /// One-dimensional pattern over `num_units` units
    pub fn linear(
        team: TeamId,
        num_units: usize,
        len: usize,
        dist: Distribution,
    ) -> DartResult<Pattern<1>> {
        let dists = [dist];
        let teamspec = TeamSpec::linear(num_units, &dists)?;
        Pattern::new(team, [len], dists, teamspec, MemoryOrder::RowMajor)
    }
}

impl Dart {
    /// Pattern over the units of `team`, arranged by [TeamSpec::balanced]
    pub fn pattern<const N: usize>(
        &self,
        team: TeamId,
        extents: [usize; N],
        dists: [Distribution; N],
        order: MemoryOrder,
    ) -> DartResult<Pattern<N>> {
        let teamspec = TeamSpec::balanced(self.team_size(team)?, &dists)?;
        Pattern::new(team, extents, dists, teamspec, order)
    }

    /// Pattern over the units of `team` with an explicit arrangement, which must cover
    /// the whole team
    pub fn pattern_with_teamspec<const N: usize>(
        &self,
        team: TeamId,
        extents: [usize; N],
        dists: [Distribution; N],
        teamspec: TeamSpec<N>,
        order: MemoryOrder,
    ) -> DartResult<Pattern<N>> {
        if teamspec.size() != self.team_size(team)? {
            return Err(DartError::Inval);
        }
        Pattern::new(team, extents, dists, teamspec, order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::team::DART_TEAM_ALL;

    fn pattern<const N: usize>(
        extents: [usize; N],
        dists: [Distribution; N],
        units: [usize; N],
        order: MemoryOrder,
    ) -> Pattern<N> {
        let teamspec = TeamSpec::new(units, MemoryOrder::RowMajor).unwrap();
        Pattern::new(DART_TEAM_ALL, extents, dists, teamspec, order).unwrap()
    }

    fn check_laws<const N: usize>(p: &Pattern<N>) {
        for i in 0..p.size() {
            assert_eq!(p.global_at(&p.coords(i).unwrap()).unwrap(), i);
        }
        let mut total = 0;
        for u in 0..p.num_units() {
            let n = p.local_size(u).unwrap();
            assert!(n <= p.local_capacity());
            for j in 0..n {
                let i = p.global(u, j).unwrap();
                assert_eq!(p.local_at(&p.coords(i).unwrap()).unwrap(), (u, j));
                assert!(p.is_local(i, u).unwrap());
            }
            total += n;
        }
        assert_eq!(total, p.size());
        let covered: usize = p.blocks().map(|b| b.size()).sum();
        assert_eq!(covered, p.size());
    }

    #[test]
    fn blocked_1d() {
        let p = Pattern::linear(DART_TEAM_ALL, 4, 20, Distribution::Blocked).unwrap();
        assert_eq!(p.unit_at(&[7]).unwrap(), 1);
        assert_eq!(p.local_at(&[7]).unwrap(), (1, 2));
        assert_eq!(p.local_capacity(), 5);
        assert!(p.is_balanced());
        check_laws(&p);
    }

    #[test]
    fn one_element_per_unit() {
        let p = Pattern::linear(DART_TEAM_ALL, 4, 4, Distribution::Blocked).unwrap();
        for u in 0..4 {
            assert_eq!(p.local_size(u).unwrap(), 1);
        }
    }

    #[test]
    fn trailing_units_keep_capacity() {
        let p = Pattern::linear(DART_TEAM_ALL, 4, 3, Distribution::Blocked).unwrap();
        assert_eq!(p.local_size(3).unwrap(), 0);
        assert!(p.local_capacity() >= 1);
        assert!(!p.is_balanced());
        check_laws(&p);
    }

    #[test]
    fn one_dimensional_distributions() {
        for dist in [
            Distribution::Blocked,
            Distribution::Cyclic,
            Distribution::BlockCyclic(3),
        ] {
            for len in [1, 5, 17, 24] {
                let p = Pattern::linear(DART_TEAM_ALL, 4, len, dist).unwrap();
                check_laws(&p);
            }
        }
    }

    #[test]
    fn two_dimensional() {
        for order in [MemoryOrder::RowMajor, MemoryOrder::ColMajor] {
            let p = pattern(
                [7, 10],
                [Distribution::Blocked, Distribution::BlockCyclic(3)],
                [2, 3],
                order,
            );
            check_laws(&p);
            let p = pattern(
                [5, 6],
                [Distribution::None, Distribution::Cyclic],
                [1, 4],
                order,
            );
            check_laws(&p);
        }
    }

    #[test]
    fn unit_rank_uses_teamspec() {
        let p = pattern(
            [4, 4],
            [Distribution::Blocked, Distribution::Blocked],
            [2, 2],
            MemoryOrder::RowMajor,
        );
        assert_eq!(p.unit_at(&[0, 3]).unwrap(), 1);
        assert_eq!(p.unit_at(&[3, 0]).unwrap(), 2);
        assert_eq!(p.local_extents(3).unwrap(), [2, 2]);
    }

    #[test]
    fn tiles_are_contiguous() {
        let p = pattern(
            [4, 8],
            [Distribution::Tile(2), Distribution::Tile(2)],
            [2, 2],
            MemoryOrder::RowMajor,
        );
        check_laws(&p);
        // first tile of unit 0 covers [0..2) x [0..2), second [0..2) x [4..6)
        assert_eq!(p.local_at(&[0, 0]).unwrap(), (0, 0));
        assert_eq!(p.local_at(&[0, 1]).unwrap(), (0, 1));
        assert_eq!(p.local_at(&[1, 0]).unwrap(), (0, 2));
        assert_eq!(p.local_at(&[1, 1]).unwrap(), (0, 3));
        assert_eq!(p.local_at(&[0, 4]).unwrap(), (0, 4));
        for b in p.blocks() {
            assert_eq!(b.local_offset % 4, 0);
        }
    }

    #[test]
    fn rejected_specs() {
        let teamspec = TeamSpec::new([4], MemoryOrder::RowMajor).unwrap();
        let order = MemoryOrder::RowMajor;
        assert!(Pattern::new(DART_TEAM_ALL, [0], [Distribution::Blocked], teamspec, order).is_err());
        assert!(Pattern::new(DART_TEAM_ALL, [8], [Distribution::None], teamspec, order).is_err());
        assert!(Pattern::new(DART_TEAM_ALL, [9], [Distribution::Tile(2)], teamspec, order).is_err());
        let spec2 = TeamSpec::new([2, 2], order).unwrap();
        assert!(Pattern::new(
            DART_TEAM_ALL,
            [4, 4],
            [Distribution::Tile(2), Distribution::Blocked],
            spec2,
            order
        )
        .is_err());
    }

    #[test]
    fn blocks_and_block_at() {
        let p = Pattern::linear(DART_TEAM_ALL, 3, 10, Distribution::BlockCyclic(3)).unwrap();
        assert_eq!(p.num_blocks(), 4);
        let blocks: Vec<_> = p.blocks().collect();
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[3].unit, 0);
        assert_eq!(blocks[3].offset, [9]);
        assert_eq!(blocks[3].extent, [1]);
        assert_eq!(blocks[3].local_offset, 3);
        assert_eq!(p.block_at(&[4]).unwrap(), blocks[1]);
        assert!(p.coords(10).is_err());
    }
}
