pub(crate) mod am;
pub(crate) mod atomic;
pub(crate) mod collective;
pub(crate) mod fabric;
pub(crate) mod mem;
pub(crate) mod rdma;

use super::{AmHandler, AmId, Backend, CommInfo, CommShutdown};
use fabric::LocalFabric;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

pub(crate) struct MyPtr {
    ptr: *mut u8,
    layout: std::alloc::Layout,
}
unsafe impl Send for MyPtr {}

/// Transport endpoint of one unit of the in-process fabric
pub(crate) struct LocalComm {
    my_unit: usize,
    num_units: usize,
    fabric: Arc<LocalFabric>,
    allocs: Mutex<HashMap<usize, MyPtr>>,
    handlers: RwLock<HashMap<AmId, AmHandler>>,
    progress_lock: Mutex<()>,
    coll_seq: Mutex<HashMap<u64, u64>>,
    sent: AtomicU64,
    handled: AtomicU64,
}

impl LocalComm {
    pub(crate) fn new(my_unit: usize, fabric: Arc<LocalFabric>) -> LocalComm {
        LocalComm {
            my_unit,
            num_units: fabric.num_units(),
            fabric,
            allocs: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            progress_lock: Mutex::new(()),
            coll_seq: Mutex::new(HashMap::new()),
            sent: AtomicU64::new(0),
            handled: AtomicU64::new(0),
        }
    }
}

impl CommInfo for LocalComm {
    fn my_unit(&self) -> usize {
        self.my_unit
    }
    fn backend(&self) -> Backend {
        Backend::Local
    }
}

impl CommShutdown for LocalComm {
    fn abort(&self) {
        tracing::error!("unit {} aborting the fabric", self.my_unit);
        self.fabric.abort();
    }

    fn is_aborted(&self) -> bool {
        self.fabric.is_aborted()
    }

    fn shutdown(&self) {
        let mut allocs = self.allocs.lock();
        for (addr, data_ptr) in allocs.drain() {
            tracing::debug!(
                "unit {} releasing leaked allocation {:x} of {} bytes",
                self.my_unit,
                addr,
                data_ptr.layout.size()
            );
            self.fabric.deregister_window(self.my_unit, addr);
            unsafe { std::alloc::dealloc(data_ptr.ptr, data_ptr.layout) };
        }
        self.handlers.write().clear();
    }
}

impl Drop for LocalComm {
    fn drop(&mut self) {
        self.shutdown();
    }
}
