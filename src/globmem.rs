//! Global memory: allocation, address translation and one-sided access through
//! global pointers.
use crate::alloc::WindowAlloc;
use crate::dart_world::Dart;
use crate::datatype::{as_bytes, as_bytes_mut, from_bytes, DartDatatype, DartOp, DartType};
use crate::error::{DartError, DartResult};
use crate::gptr::GlobalPtr;
use crate::segment::{SegmentEntry, LOCAL_SEGMENT};
use crate::team::{TeamId, DART_TEAM_ALL};
use crate::transport::{Comm, CommAtomic, CommCollective, CommMem, CommRdma};
use crate::warnings::RuntimeWarning;

use std::sync::Arc;

/// Completion handle of a non-blocking put or get.
///
/// The handle is complete once [Dart::wait] returned or [Dart::test] reported completion.
#[must_use = "a transfer handle should be waited on or tested"]
pub struct DartHandle {
    comm: Arc<Comm>,
    unit: usize,
    what: &'static str,
    done: bool,
}

impl std::fmt::Debug for DartHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DartHandle({} to unit {}, done: {})", self.what, self.unit, self.done)
    }
}

impl DartHandle {
    fn complete(&mut self) -> DartResult<()> {
        if !self.done {
            self.comm.flush_local(self.unit)?;
            self.done = true;
        }
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl Drop for DartHandle {
    fn drop(&mut self) {
        if !self.done {
            RuntimeWarning::DroppedHandle(self.what).print();
            let _ = self.complete();
        }
    }
}

fn check_accumulate_op(op: DartOp) -> DartResult<()> {
    match op {
        DartOp::MinMax | DartOp::Replace | DartOp::NoOp => Err(DartError::Inval),
        _ => Ok(()),
    }
}

impl Dart {
    /// Global unit and absolute address of `len` bytes at `gptr`
    pub(crate) fn resolve(&self, gptr: &GlobalPtr, len: usize) -> DartResult<(usize, usize)> {
        self.check_active()?;
        if gptr.is_null() {
            return Err(DartError::Inval);
        }
        if gptr.segment_id() == LOCAL_SEGMENT {
            let unit = gptr.unit();
            let addr = usize::try_from(gptr.addr_or_offset()).map_err(|_| DartError::Inval)?;
            if unit >= self.num_units() {
                return Err(DartError::Inval);
            }
            if !self.inner.comm.is_accessible(unit, addr, len) {
                return Err(DartError::NotFound);
            }
            if unit == self.my_unit() && !self.inner.window.contains(addr, len) {
                return Err(DartError::NotFound);
            }
            Ok((unit, addr))
        } else {
            let team = self.team_data(gptr.team_id())?;
            let segments = team.segments.read();
            let entry = segments.get(gptr.segment_id())?;
            let addr = entry.addr(gptr.unit(), gptr.addr_or_offset(), len)?;
            Ok((team.global_unit(gptr.unit())?, addr))
        }
    }

    /// Allocate `nbytes` visible to every unit without a collective call.
    /// The returned pointer lives in segment 0 and carries the local address.
    #[tracing::instrument(skip_all, level = "trace")]
    pub fn memalloc(&self, nbytes: usize) -> DartResult<GlobalPtr> {
        self.check_active()?;
        match self.inner.window.try_malloc(nbytes, std::mem::align_of::<u128>()) {
            Some(addr) => Ok(GlobalPtr::new(
                self.my_unit(),
                DART_TEAM_ALL,
                LOCAL_SEGMENT,
                addr as u64,
            )),
            None => {
                tracing::error!(
                    "unit {} window exhausted allocating {} bytes ({} in use)",
                    self.my_unit(),
                    nbytes,
                    self.inner.window.occupied()
                );
                Err(DartError::Other)
            }
        }
    }

    /// Free memory obtained from [Dart::memalloc] on this unit
    pub fn memfree(&self, gptr: GlobalPtr) -> DartResult<()> {
        self.check_active()?;
        if gptr.segment_id() != LOCAL_SEGMENT || gptr.unit() != self.my_unit() || gptr.is_null() {
            return Err(DartError::Inval);
        }
        let addr = usize::try_from(gptr.addr_or_offset()).map_err(|_| DartError::Inval)?;
        self.inner.window.free(addr)
    }

    /// Allocate `nbytes` at every member of `team`, collective over `team`.
    ///
    /// Returns a pointer to offset 0 of the first member's part; retarget it with
    /// [GlobalPtr::set_unit] to reach the part of another member.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn team_memalloc_aligned(&self, team: TeamId, nbytes: usize) -> DartResult<GlobalPtr> {
        let data = self.team_data(team)?;
        let proposed = *data.next_segid.lock() as i64;
        let mut segid = 0i64;
        self.inner.comm.allreduce(
            &data.coll,
            as_bytes(&[proposed]),
            as_bytes_mut(std::slice::from_mut(&mut segid)),
            DartOp::Max,
            DartDatatype::Long,
        )?;
        if segid <= 0 || segid >= i16::MAX as i64 {
            tracing::error!("{} ran out of segment ids", team);
            return Err(DartError::Other);
        }
        *data.next_segid.lock() = segid as i16 + 1;

        let local_addr = self.inner.comm.alloc(nbytes.max(1), std::mem::align_of::<u128>())?;
        let bases = self
            .inner
            .comm
            .allgather(&data.coll, as_bytes(&[local_addr]))?
            .iter()
            .map(|bytes| from_bytes::<usize>(bytes).first().copied().ok_or(DartError::Other))
            .collect::<DartResult<Vec<usize>>>()?;
        data.segments.write().insert(SegmentEntry {
            segid: segid as i16,
            size: nbytes,
            bases,
            local_addr,
        })?;
        tracing::debug!(
            "unit {} allocated segment {} of {} ({} bytes per unit)",
            self.my_unit(),
            segid,
            team,
            nbytes
        );
        Ok(GlobalPtr::new(0, team, segid as i16, 0))
    }

    /// Release a segment allocated with [Dart::team_memalloc_aligned], collective over its team.
    /// The segment id is never handed out again.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn team_memfree(&self, gptr: GlobalPtr) -> DartResult<()> {
        if gptr.is_null() || gptr.segment_id() == LOCAL_SEGMENT {
            return Err(DartError::Inval);
        }
        let data = self.team_data(gptr.team_id())?;
        self.inner.comm.barrier(&data.coll)?;
        let entry = data.segments.write().remove(gptr.segment_id())?;
        self.inner.comm.free(entry.local_addr)
    }

    /// Local address of the memory `gptr` refers to, which must be owned by the calling unit
    pub fn gptr_getaddr(&self, gptr: &GlobalPtr) -> DartResult<*mut u8> {
        if !self.gptr_is_local(gptr)? {
            return Err(DartError::Inval);
        }
        let (_, addr) = self.resolve(gptr, 0)?;
        Ok(addr as *mut u8)
    }

    /// Whether the calling unit owns the memory `gptr` refers to
    pub fn gptr_is_local(&self, gptr: &GlobalPtr) -> DartResult<bool> {
        if gptr.segment_id() == LOCAL_SEGMENT {
            self.check_active()?;
            Ok(gptr.unit() == self.my_unit())
        } else {
            Ok(gptr.unit() == self.team_data(gptr.team_id())?.my_rank)
        }
    }

    /// Copy `src` to `gptr`; returns once `src` may be reused
    pub fn put_blocking<T: DartType>(&self, gptr: GlobalPtr, src: &[T]) -> DartResult<()> {
        let bytes = as_bytes(src);
        let (unit, addr) = self.resolve(&gptr, bytes.len())?;
        self.inner.comm.put(unit, addr, bytes)?;
        self.inner.comm.flush_local(unit)
    }

    /// Copy from `gptr` into `dst`; returns once `dst` holds the data
    pub fn get_blocking<T: DartType>(&self, dst: &mut [T], gptr: GlobalPtr) -> DartResult<()> {
        let bytes = as_bytes_mut(dst);
        let (unit, addr) = self.resolve(&gptr, bytes.len())?;
        self.inner.comm.get(unit, addr, bytes)?;
        self.inner.comm.flush_local(unit)
    }

    pub fn put<T: DartType>(&self, gptr: GlobalPtr, src: &[T]) -> DartResult<DartHandle> {
        let bytes = as_bytes(src);
        let (unit, addr) = self.resolve(&gptr, bytes.len())?;
        self.inner.comm.put(unit, addr, bytes)?;
        Ok(self.handle(unit, "put handle"))
    }

    pub fn get<T: DartType>(&self, dst: &mut [T], gptr: GlobalPtr) -> DartResult<DartHandle> {
        let bytes = as_bytes_mut(dst);
        let (unit, addr) = self.resolve(&gptr, bytes.len())?;
        self.inner.comm.get(unit, addr, bytes)?;
        Ok(self.handle(unit, "get handle"))
    }

    fn handle(&self, unit: usize, what: &'static str) -> DartHandle {
        DartHandle {
            comm: self.inner.comm.clone(),
            unit,
            what,
            done: false,
        }
    }

    /// Block until the transfer of `handle` completed locally
    pub fn wait(&self, mut handle: DartHandle) -> DartResult<()> {
        handle.complete()
    }

    /// Poll `handle`, true once its transfer completed locally
    pub fn test(&self, handle: &mut DartHandle) -> DartResult<bool> {
        handle.complete()?;
        Ok(handle.done)
    }

    pub fn waitall(&self, handles: Vec<DartHandle>) -> DartResult<()> {
        handles.into_iter().try_for_each(|h| self.wait(h))
    }

    /// True once every handle completed
    pub fn testall(&self, handles: &mut [DartHandle]) -> DartResult<bool> {
        let mut all = true;
        for handle in handles.iter_mut() {
            all &= self.test(handle)?;
        }
        Ok(all)
    }

    /// Local completion of everything issued to the unit owning `gptr`
    pub fn flush_local(&self, gptr: GlobalPtr) -> DartResult<()> {
        let (unit, _) = self.resolve(&gptr, 0)?;
        self.inner.comm.flush_local(unit)
    }

    /// Remote completion of everything issued to the unit owning `gptr`
    pub fn flush(&self, gptr: GlobalPtr) -> DartResult<()> {
        let (unit, _) = self.resolve(&gptr, 0)?;
        self.inner.comm.flush(unit)
    }

    pub fn flush_all(&self) -> DartResult<()> {
        self.check_active()?;
        self.inner.comm.flush_all()
    }

    pub fn flush_local_all(&self) -> DartResult<()> {
        self.check_active()?;
        (0..self.num_units()).try_for_each(|unit| self.inner.comm.flush_local(unit))
    }

    /// Atomically combine `values` into the memory at `gptr` with `op`, element by element
    pub fn accumulate<T: DartType>(&self, gptr: GlobalPtr, values: &[T], op: DartOp) -> DartResult<()> {
        check_accumulate_op(op)?;
        let bytes = as_bytes(values);
        let (unit, addr) = self.resolve(&gptr, bytes.len())?;
        self.inner
            .comm
            .atomic_op(unit, addr, op, T::DATATYPE, bytes, None)
    }

    /// Atomically apply `op` with `value` to the element at `gptr`, returning its previous value.
    /// [DartOp::NoOp] is an atomic load, [DartOp::Replace] an atomic swap.
    pub fn fetch_and_op<T: DartType>(&self, gptr: GlobalPtr, value: T, op: DartOp) -> DartResult<T> {
        if op == DartOp::MinMax {
            return Err(DartError::Inval);
        }
        let (unit, addr) = self.resolve(&gptr, std::mem::size_of::<T>())?;
        let mut old = [T::default()];
        self.inner.comm.atomic_op(
            unit,
            addr,
            op,
            T::DATATYPE,
            as_bytes(&[value]),
            Some(as_bytes_mut(&mut old)),
        )?;
        Ok(old[0])
    }

    /// Store `new` at `gptr` if it holds `expected`; returns the value found
    pub fn compare_and_swap<T: DartType>(
        &self,
        gptr: GlobalPtr,
        new: T,
        expected: T,
    ) -> DartResult<T> {
        let (unit, addr) = self.resolve(&gptr, std::mem::size_of::<T>())?;
        let mut old = [T::default()];
        self.inner.comm.compare_and_swap(
            unit,
            addr,
            T::DATATYPE,
            as_bytes(&[new]),
            as_bytes(&[expected]),
            as_bytes_mut(&mut old),
        )?;
        Ok(old[0])
    }

    pub fn put_value<T: DartType>(&self, gptr: GlobalPtr, value: T) -> DartResult<()> {
        self.put_blocking(gptr, &[value])
    }

    pub fn get_value<T: DartType>(&self, gptr: GlobalPtr) -> DartResult<T> {
        let mut val = [T::default()];
        self.get_blocking(&mut val, gptr)?;
        Ok(val[0])
    }
}
