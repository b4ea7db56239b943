//! Views: rectangular sub-domains of a pattern, optionally restricted to one unit.
//!
//! A view is materialized either element by element ([View::indices]) or as the pattern
//! blocks it intersects, clipped to the view and described by contiguous runs of local
//! storage ([View::blocks], [View::transfer_plan]).
use crate::dart_world::Dart;
use crate::datatype::DartType;
use crate::error::{DartError, DartResult};
use crate::gptr::GlobalPtr;
use crate::pattern::{CartesianIndexSpace, Pattern};

use itertools::Itertools;
use std::mem::size_of;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct View<const N: usize> {
    pattern: Pattern<N>,
    offset: [usize; N],
    extent: [usize; N],
    unit: Option<usize>,
}

/// The part of one pattern block inside a view
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewBlock<const N: usize> {
    /// team-relative owner
    pub unit: usize,
    /// global coordinates of the first element
    pub offset: [usize; N],
    pub extent: [usize; N],
    /// `(local_start, len)` runs of the owner's local storage, in view order
    pub runs: Vec<(usize, usize)>,
}

impl<const N: usize> ViewBlock<N> {
    pub fn size(&self) -> usize {
        self.extent.iter().product()
    }
}

/// One contiguous copy between a unit's local storage and a dense view buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Transfer {
    pub unit: usize,
    pub local_start: usize,
    pub len: usize,
    /// position in the view buffer, linearized in the pattern's memory order
    pub view_start: usize,
}

impl<const N: usize> Pattern<N> {
    /// View of the whole index space
    pub fn view(&self) -> View<N> {
        View {
            pattern: *self,
            offset: [0; N],
            extent: self.extents(),
            unit: None,
        }
    }
}

impl<const N: usize> View<N> {
    /// View of the rectangle at global `offset` with `extent`. Zero extents give an
    /// empty view.
    pub fn new(pattern: Pattern<N>, offset: [usize; N], extent: [usize; N]) -> DartResult<View<N>> {
        pattern.view().sub(offset, extent)
    }

    pub fn pattern(&self) -> &Pattern<N> {
        &self.pattern
    }

    pub fn offset(&self) -> [usize; N] {
        self.offset
    }

    pub fn extent(&self) -> [usize; N] {
        self.extent
    }

    /// The unit this view is restricted to, if any
    pub fn unit(&self) -> Option<usize> {
        self.unit
    }

    /// Volume of the view rectangle, ignoring a unit restriction
    pub fn size(&self) -> usize {
        self.extent.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Sub-view at `offset` relative to this view
    pub fn sub(&self, offset: [usize; N], extent: [usize; N]) -> DartResult<View<N>> {
        let mut abs = [0; N];
        for d in 0..N {
            if offset[d] + extent[d] > self.extent[d] {
                return Err(DartError::Inval);
            }
            abs[d] = self.offset[d] + offset[d];
        }
        Ok(View {
            pattern: self.pattern,
            offset: abs,
            extent,
            unit: self.unit,
        })
    }

    /// The same rectangle, only the elements owned by `unit`
    pub fn local(&self, unit: usize) -> DartResult<View<N>> {
        if unit >= self.pattern.num_units() {
            return Err(DartError::Inval);
        }
        Ok(View {
            unit: Some(unit),
            ..*self
        })
    }

    fn space(&self) -> CartesianIndexSpace<N> {
        CartesianIndexSpace::new(self.extent, self.pattern.memory_order())
    }

    fn shifted(&self, base: &[usize; N], rel: &[usize; N]) -> [usize; N] {
        let mut c = [0; N];
        for d in 0..N {
            c[d] = base[d] + rel[d];
        }
        c
    }

    fn owned(&self, unit: usize) -> bool {
        self.unit.map_or(true, |u| u == unit)
    }

    /// Global indices of the view's elements in view order
    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.space().iter().filter_map(move |rel| {
            let coords = self.shifted(&self.offset, &rel);
            if !self.owned(self.pattern.unit_at(&coords).ok()?) {
                return None;
            }
            self.pattern.global_at(&coords).ok()
        })
    }

    /// Rows of the clipped rectangle at `lo` with `ext` along the fastest dimension,
    /// as transfers
    fn rows(&self, lo: &[usize; N], ext: &[usize; N]) -> Vec<Transfer> {
        let order = self.pattern.memory_order();
        let fastest = order.fastest_dim(N);
        let mut row_grid = *ext;
        row_grid[fastest] = 1;
        let view_space = self.space();
        CartesianIndexSpace::new(row_grid, order)
            .iter()
            .filter_map(|rel| {
                let coords = self.shifted(lo, &rel);
                let (unit, local_start) = self.pattern.local_at(&coords).ok()?;
                let mut in_view = [0; N];
                for d in 0..N {
                    in_view[d] = coords[d] - self.offset[d];
                }
                Some(Transfer {
                    unit,
                    local_start,
                    len: ext[fastest],
                    view_start: view_space.linearize(&in_view).ok()?,
                })
            })
            .collect()
    }

    /// Pattern blocks intersecting the view, clipped to it, in block order.
    /// An empty view has no blocks.
    pub fn blocks(&self) -> Vec<ViewBlock<N>> {
        if self.is_empty() {
            return Vec::new();
        }
        let bs = self.pattern.block_extents();
        let mut first = [0; N];
        let mut count = [0; N];
        for d in 0..N {
            first[d] = self.offset[d] / bs[d];
            count[d] = (self.offset[d] + self.extent[d] - 1) / bs[d] - first[d] + 1;
        }
        CartesianIndexSpace::new(count, self.pattern.memory_order())
            .iter()
            .filter_map(|rel| {
                let block = self.pattern.block(&self.shifted(&first, &rel)).ok()?;
                if !self.owned(block.unit) {
                    return None;
                }
                let mut lo = [0; N];
                let mut ext = [0; N];
                for d in 0..N {
                    lo[d] = block.offset[d].max(self.offset[d]);
                    let hi = (block.offset[d] + block.extent[d]).min(self.offset[d] + self.extent[d]);
                    ext[d] = hi - lo[d];
                }
                let runs = self
                    .rows(&lo, &ext)
                    .into_iter()
                    .map(|t| (t.local_start, t.len))
                    .coalesce(|a, b| {
                        if a.0 + a.1 == b.0 {
                            Ok((a.0, a.1 + b.1))
                        } else {
                            Err((a, b))
                        }
                    })
                    .collect();
                Some(ViewBlock {
                    unit: block.unit,
                    offset: lo,
                    extent: ext,
                    runs,
                })
            })
            .collect()
    }

    /// The copies moving the view between the owners' local storage and a dense
    /// buffer of [View::size] elements, merged where both sides are contiguous
    pub fn transfer_plan(&self) -> Vec<Transfer> {
        let mut rows: Vec<Transfer> = self
            .blocks()
            .iter()
            .flat_map(|b| self.rows(&b.offset, &b.extent))
            .collect();
        rows.sort_by_key(|t| t.view_start);
        rows.into_iter()
            .coalesce(|a, b| {
                if a.unit == b.unit
                    && a.local_start + a.len == b.local_start
                    && a.view_start + a.len == b.view_start
                {
                    Ok(Transfer {
                        len: a.len + b.len,
                        ..a
                    })
                } else {
                    Err((a, b))
                }
            })
            .collect()
    }
}

impl Dart {
    fn view_transfers<T: DartType, const N: usize>(
        &self,
        base: &GlobalPtr,
        view: &View<N>,
        buf_len: usize,
    ) -> DartResult<Vec<(Transfer, GlobalPtr)>> {
        if base.team_id() != view.pattern().team() || buf_len != view.size() {
            return Err(DartError::Inval);
        }
        view.transfer_plan()
            .into_iter()
            .map(|t| {
                let bytes = (t.local_start * size_of::<T>()) as i64;
                Ok((t, base.with_unit(t.unit)?.offset_by(bytes)?))
            })
            .collect()
    }

    /// Read the elements of `view` from the team allocation at `base` into `dst`,
    /// laid out densely in view order. Positions a unit-restricted view excludes are
    /// left untouched.
    #[tracing::instrument(skip_all, level = "trace")]
    pub fn get_view_blocking<T: DartType, const N: usize>(
        &self,
        base: GlobalPtr,
        view: &View<N>,
        dst: &mut [T],
    ) -> DartResult<()> {
        for (t, gptr) in self.view_transfers::<T, N>(&base, view, dst.len())? {
            self.get_blocking(&mut dst[t.view_start..t.view_start + t.len], gptr)?;
        }
        Ok(())
    }

    /// Write `src`, laid out densely in view order, to the elements of `view` in the
    /// team allocation at `base`
    #[tracing::instrument(skip_all, level = "trace")]
    pub fn put_view_blocking<T: DartType, const N: usize>(
        &self,
        base: GlobalPtr,
        view: &View<N>,
        src: &[T],
    ) -> DartResult<()> {
        for (t, gptr) in self.view_transfers::<T, N>(&base, view, src.len())? {
            self.put_blocking(gptr, &src[t.view_start..t.view_start + t.len])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{Distribution, MemoryOrder, TeamSpec};
    use crate::team::DART_TEAM_ALL;

    fn grid(order: MemoryOrder) -> Pattern<2> {
        let teamspec = TeamSpec::new([2, 2], MemoryOrder::RowMajor).unwrap();
        Pattern::new(
            DART_TEAM_ALL,
            [6, 8],
            [Distribution::Blocked, Distribution::BlockCyclic(2)],
            teamspec,
            order,
        )
        .unwrap()
    }

    #[test]
    fn empty_view_has_no_blocks() {
        let view = View::new(grid(MemoryOrder::RowMajor), [1, 1], [0, 3]).unwrap();
        assert!(view.is_empty());
        assert!(view.blocks().is_empty());
        assert!(view.transfer_plan().is_empty());
        assert_eq!(view.indices().count(), 0);
    }

    #[test]
    fn whole_view_covers_every_block() {
        let p = grid(MemoryOrder::RowMajor);
        let view = p.view();
        let blocks = view.blocks();
        assert_eq!(blocks.len(), p.num_blocks());
        assert_eq!(blocks.iter().map(|b| b.size()).sum::<usize>(), p.size());
        let indices: Vec<usize> = view.indices().collect();
        assert_eq!(indices, (0..p.size()).collect::<Vec<_>>());
    }

    #[test]
    fn clipped_blocks_and_runs() {
        let p = Pattern::linear(DART_TEAM_ALL, 4, 20, Distribution::Blocked).unwrap();
        let view = View::new(p, [3], [9]).unwrap();
        let blocks = view.blocks();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].unit, 0);
        assert_eq!(blocks[0].offset, [3]);
        assert_eq!(blocks[0].runs, vec![(3, 2)]);
        assert_eq!(blocks[1].runs, vec![(0, 5)]);
        assert_eq!(blocks[2].unit, 2);
        assert_eq!(blocks[2].runs, vec![(0, 2)]);
    }

    #[test]
    fn strided_runs_in_two_dimensions() {
        // unit 0 holds rows 0..3 and columns {0,1,4,5}: local extents [3, 4]
        let p = grid(MemoryOrder::RowMajor);
        let view = View::new(p, [0, 0], [2, 2]).unwrap();
        let blocks = view.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].runs, vec![(0, 2), (4, 2)]);
        // a full local row of unit 0 spans two blocks and is one run in each
        let view = View::new(p, [1, 0], [1, 6]).unwrap();
        let runs: Vec<_> = view
            .blocks()
            .into_iter()
            .filter(|b| b.unit == 0)
            .flat_map(|b| b.runs)
            .collect();
        assert_eq!(runs, vec![(4, 2), (6, 2)]);
    }

    #[test]
    fn transfer_plan_covers_view_once() {
        for order in [MemoryOrder::RowMajor, MemoryOrder::ColMajor] {
            let p = grid(order);
            let view = View::new(p, [1, 1], [4, 6]).unwrap();
            let mut covered = vec![0; view.size()];
            for t in view.transfer_plan() {
                for k in 0..t.len {
                    covered[t.view_start + k] += 1;
                    let expect = view.indices().nth(t.view_start + k).unwrap();
                    let coords = p.coords(expect).unwrap();
                    assert_eq!(p.local_at(&coords).unwrap(), (t.unit, t.local_start + k));
                }
            }
            assert!(covered.iter().all(|&c| c == 1));
        }
    }

    #[test]
    fn local_and_sub_views() {
        let p = Pattern::linear(DART_TEAM_ALL, 4, 20, Distribution::Cyclic).unwrap();
        let local = p.view().local(1).unwrap();
        let indices: Vec<usize> = local.indices().collect();
        assert_eq!(indices, vec![1, 5, 9, 13, 17]);
        assert!(local.blocks().iter().all(|b| b.unit == 1));
        let sub = local.sub([4], [8]).unwrap();
        assert_eq!(sub.indices().collect::<Vec<_>>(), vec![5, 9]);
        assert!(p.view().sub([15], [6]).is_err());
        assert!(p.view().local(4).is_err());
    }
}
