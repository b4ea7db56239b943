use crate::datatype::{reduce_bytes, DartDatatype, DartOp};
use crate::error::{DartError, DartResult};
use crate::transport::{CommAtomic, CommMem};

use super::LocalComm;

impl CommAtomic for LocalComm {
    #[tracing::instrument(skip_all, level = "trace")]
    fn atomic_op(
        &self,
        unit: usize,
        remote_addr: usize,
        op: DartOp,
        dtype: DartDatatype,
        operand: &[u8],
        fetch: Option<&mut [u8]>,
    ) -> DartResult<()> {
        if unit >= self.num_units || operand.len() % dtype.size() != 0 {
            return Err(DartError::Inval);
        }
        if !self.is_accessible(unit, remote_addr, operand.len()) {
            return Err(DartError::NotFound);
        }
        let _guards = self.fabric.lock_stripes(remote_addr, operand.len());
        let target =
            unsafe { std::slice::from_raw_parts_mut(remote_addr as *mut u8, operand.len()) };
        if let Some(fetch) = fetch {
            if fetch.len() != operand.len() {
                return Err(DartError::Inval);
            }
            fetch.copy_from_slice(target);
        }
        reduce_bytes(op, dtype, target, operand)
    }

    #[tracing::instrument(skip_all, level = "trace")]
    fn compare_and_swap(
        &self,
        unit: usize,
        remote_addr: usize,
        dtype: DartDatatype,
        value: &[u8],
        compare: &[u8],
        result: &mut [u8],
    ) -> DartResult<()> {
        let len = dtype.size();
        if unit >= self.num_units
            || dtype.is_float()
            || value.len() != len
            || compare.len() != len
            || result.len() != len
        {
            return Err(DartError::Inval);
        }
        if !self.is_accessible(unit, remote_addr, len) {
            return Err(DartError::NotFound);
        }
        let _guards = self.fabric.lock_stripes(remote_addr, len);
        let target = unsafe { std::slice::from_raw_parts_mut(remote_addr as *mut u8, len) };
        result.copy_from_slice(target);
        if target == compare {
            target.copy_from_slice(value);
        }
        Ok(())
    }
}
