use crate::error::{DartError, DartResult};
use crate::transport::CommMem;

use super::{LocalComm, MyPtr};

impl CommMem for LocalComm {
    fn alloc(&self, size: usize, align: usize) -> DartResult<usize> {
        let layout = std::alloc::Layout::from_size_align(size.max(1), align.max(1))
            .map_err(|_| DartError::Inval)?;
        let data_ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if data_ptr.is_null() {
            tracing::error!("unit {} out of memory allocating {} bytes", self.my_unit, size);
            return Err(DartError::Other);
        }
        let data_addr = data_ptr as usize;
        self.allocs.lock().insert(
            data_addr,
            MyPtr {
                ptr: data_ptr,
                layout,
            },
        );
        self.fabric.register_window(self.my_unit, data_addr, size);
        tracing::trace!("unit {} alloc {:x} size {}", self.my_unit, data_addr, size);
        Ok(data_addr)
    }

    fn free(&self, addr: usize) -> DartResult<()> {
        let mut allocs = self.allocs.lock();
        match allocs.remove(&addr) {
            Some(data_ptr) => {
                self.fabric.deregister_window(self.my_unit, addr);
                unsafe { std::alloc::dealloc(data_ptr.ptr, data_ptr.layout) };
                Ok(())
            }
            None => Err(DartError::NotFound),
        }
    }

    fn is_accessible(&self, unit: usize, addr: usize, len: usize) -> bool {
        self.fabric.is_accessible(unit, addr, len)
    }
}
