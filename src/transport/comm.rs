use super::local_transport::LocalComm;
use super::{AmHandler, AmId, Backend, CollGroup};
use crate::datatype::{reduce_all, DartDatatype, DartOp};
use crate::error::{DartError, DartResult};

use enum_dispatch::enum_dispatch;

#[enum_dispatch]
pub(crate) trait CommInfo {
    fn my_unit(&self) -> usize;
    fn backend(&self) -> Backend;
}

#[enum_dispatch]
pub(crate) trait CommMem {
    /// Allocate `size` bytes of zeroed, remotely accessible memory at the calling unit
    fn alloc(&self, size: usize, align: usize) -> DartResult<usize>;
    fn free(&self, addr: usize) -> DartResult<()>;
    /// Check that `[addr, addr+len)` lies within memory registered by `unit`
    fn is_accessible(&self, unit: usize, addr: usize, len: usize) -> bool;
}

#[enum_dispatch]
pub(crate) trait CommRdma {
    fn put(&self, unit: usize, remote_addr: usize, src: &[u8]) -> DartResult<()>;
    fn get(&self, unit: usize, remote_addr: usize, dst: &mut [u8]) -> DartResult<()>;
    /// Local completion of every operation issued to `unit`
    fn flush_local(&self, unit: usize) -> DartResult<()>;
    /// Remote completion of every operation issued to `unit`
    fn flush(&self, unit: usize) -> DartResult<()>;
    fn flush_all(&self) -> DartResult<()>;
}

#[enum_dispatch]
pub(crate) trait CommAtomic {
    /// `target = op(target, operand)` element-wise, optionally returning the previous contents
    fn atomic_op(
        &self,
        unit: usize,
        remote_addr: usize,
        op: DartOp,
        dtype: DartDatatype,
        operand: &[u8],
        fetch: Option<&mut [u8]>,
    ) -> DartResult<()>;
    fn compare_and_swap(
        &self,
        unit: usize,
        remote_addr: usize,
        dtype: DartDatatype,
        value: &[u8],
        compare: &[u8],
        result: &mut [u8],
    ) -> DartResult<()>;
}

#[enum_dispatch]
pub(crate) trait CommCollective {
    /// Every member contributes `data`, every member receives all contributions in member order.
    /// Waiting keeps the active-message queue progressing.
    fn allgather(&self, group: &CollGroup, data: &[u8]) -> DartResult<Vec<Vec<u8>>>;
}

#[enum_dispatch]
pub(crate) trait CommAm {
    fn register_handler(&self, id: AmId, handler: AmHandler);
    /// Enqueue an active message at `unit`; messages between a pair of units arrive in order
    fn request_send(&self, unit: usize, id: AmId, payload: Vec<u8>) -> DartResult<()>;
    /// Run the handlers of all queued incoming messages, returns how many ran
    fn progress(&self) -> usize;
    /// (messages sent, messages handled) by this unit so far
    fn am_counts(&self) -> (u64, u64);
}

#[enum_dispatch]
pub(crate) trait CommShutdown {
    /// Fail every unit blocked in the transport
    fn abort(&self);
    fn is_aborted(&self) -> bool;
    fn shutdown(&self);
}

#[enum_dispatch(CommInfo, CommMem, CommRdma, CommAtomic, CommCollective, CommAm, CommShutdown)]
pub(crate) enum Comm {
    Local(LocalComm),
}

impl std::fmt::Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Comm({:?}, unit {})", self.backend(), self.my_unit())
    }
}

//collectives every backend derives from allgather
impl Comm {
    pub(crate) fn barrier(&self, group: &CollGroup) -> DartResult<()> {
        self.allgather(group, &[])?;
        Ok(())
    }

    pub(crate) fn bcast(&self, group: &CollGroup, root: usize, buf: &mut [u8]) -> DartResult<()> {
        if root >= group.size() {
            return Err(DartError::Inval);
        }
        let data: &[u8] = if root == group.my_index { &*buf } else { &[] };
        let all = self.allgather(group, data)?;
        if all[root].len() != buf.len() {
            return Err(DartError::Inval);
        }
        buf.copy_from_slice(&all[root]);
        Ok(())
    }

    pub(crate) fn allgather_into(
        &self,
        group: &CollGroup,
        src: &[u8],
        dst: &mut [u8],
    ) -> DartResult<()> {
        let all = self.allgather(group, src)?;
        if dst.len() != src.len() * group.size() || all.iter().any(|c| c.len() != src.len()) {
            return Err(DartError::Inval);
        }
        for (chunk, contrib) in dst.chunks_mut(src.len().max(1)).zip(all.iter()) {
            chunk.copy_from_slice(contrib);
        }
        Ok(())
    }

    pub(crate) fn allreduce(
        &self,
        group: &CollGroup,
        src: &[u8],
        dst: &mut [u8],
        op: DartOp,
        dtype: DartDatatype,
    ) -> DartResult<()> {
        let all = self.allgather(group, src)?;
        if src.len() != dst.len()
            || src.len() % dtype.size() != 0
            || all.iter().any(|c| c.len() != src.len())
        {
            return Err(DartError::Inval);
        }
        dst.copy_from_slice(&reduce_all(op, dtype, &all)?);
        Ok(())
    }

    /// Like allreduce, but only `root` receives the result
    pub(crate) fn reduce(
        &self,
        group: &CollGroup,
        root: usize,
        src: &[u8],
        dst: &mut [u8],
        op: DartOp,
        dtype: DartDatatype,
    ) -> DartResult<()> {
        if root >= group.size() {
            return Err(DartError::Inval);
        }
        let all = self.allgather(group, src)?;
        if src.len() % dtype.size() != 0 || all.iter().any(|c| c.len() != src.len()) {
            return Err(DartError::Inval);
        }
        if group.my_index == root {
            if dst.len() != src.len() {
                return Err(DartError::Inval);
            }
            dst.copy_from_slice(&reduce_all(op, dtype, &all)?);
        }
        Ok(())
    }

    /// `dst` is only written at `root` and must hold `size * src.len()` bytes there
    pub(crate) fn gather(
        &self,
        group: &CollGroup,
        root: usize,
        src: &[u8],
        dst: &mut [u8],
    ) -> DartResult<()> {
        if root >= group.size() {
            return Err(DartError::Inval);
        }
        let all = self.allgather(group, src)?;
        if all.iter().any(|c| c.len() != src.len()) {
            return Err(DartError::Inval);
        }
        if group.my_index == root {
            if dst.len() != src.len() * group.size() {
                return Err(DartError::Inval);
            }
            for (chunk, contrib) in dst.chunks_mut(src.len().max(1)).zip(all.iter()) {
                chunk.copy_from_slice(contrib);
            }
        }
        Ok(())
    }

    /// `src` is only read at `root` and must hold `size * dst.len()` bytes there
    pub(crate) fn scatter(
        &self,
        group: &CollGroup,
        root: usize,
        src: &[u8],
        dst: &mut [u8],
    ) -> DartResult<()> {
        if root >= group.size() {
            return Err(DartError::Inval);
        }
        let data: &[u8] = if root == group.my_index { src } else { &[] };
        let all = self.allgather(group, data)?;
        if all[root].len() != dst.len() * group.size() {
            return Err(DartError::Inval);
        }
        let start = group.my_index * dst.len();
        dst.copy_from_slice(&all[root][start..start + dst.len()]);
        Ok(())
    }
}
