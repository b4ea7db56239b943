use crate::error::{DartError, DartResult};
use crate::transport::CommRdma;

use super::LocalComm;

use tracing::trace;

impl LocalComm {
    fn check(&self, unit: usize, addr: usize, len: usize) -> DartResult<()> {
        if unit >= self.num_units {
            return Err(DartError::Inval);
        }
        if len > 0 && !self.fabric.is_accessible(unit, addr, len) {
            tracing::debug!(
                "unit {} address {:x}+{} not registered at unit {}",
                self.my_unit,
                addr,
                len,
                unit
            );
            return Err(DartError::NotFound);
        }
        Ok(())
    }
}

// every unit shares the address space, so operations complete when issued
impl CommRdma for LocalComm {
    #[tracing::instrument(skip_all, level = "trace")]
    fn put(&self, unit: usize, remote_addr: usize, src: &[u8]) -> DartResult<()> {
        self.check(unit, remote_addr, src.len())?;
        let dst = remote_addr as *mut u8;
        trace!("putting src: {:?} dst: {:?} len: {}", src.as_ptr(), dst, src.len());
        unsafe { std::ptr::copy(src.as_ptr(), dst, src.len()) };
        Ok(())
    }

    #[tracing::instrument(skip_all, level = "trace")]
    fn get(&self, unit: usize, remote_addr: usize, dst: &mut [u8]) -> DartResult<()> {
        self.check(unit, remote_addr, dst.len())?;
        let src = remote_addr as *const u8;
        trace!("getting src: {:?} dst: {:?} len: {}", src, dst.as_ptr(), dst.len());
        unsafe { std::ptr::copy(src, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn flush_local(&self, unit: usize) -> DartResult<()> {
        if unit >= self.num_units {
            return Err(DartError::Inval);
        }
        Ok(())
    }

    fn flush(&self, unit: usize) -> DartResult<()> {
        if unit >= self.num_units {
            return Err(DartError::Inval);
        }
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn flush_all(&self) -> DartResult<()> {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
