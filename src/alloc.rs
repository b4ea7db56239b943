//! Allocators handing out pieces of a pre-registered window.
//!
//! Non-collective allocations are carved from a per-unit window that the transport
//! registered at init, so any unit can address them without a collective call.
use crate::error::{DartError, DartResult};

use indexmap::IndexSet;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// The contract a window allocator fulfils
pub trait WindowAlloc: Send + Sync {
    /// Manage `[start_addr, start_addr + size)`
    fn init(&mut self, start_addr: usize, size: usize);
    /// Allocate `size` bytes aligned to `align`, `None` if the window is exhausted
    fn try_malloc(&self, size: usize, align: usize) -> Option<usize>;
    fn free(&self, addr: usize) -> DartResult<()>;
    /// Check that `[addr, addr+len)` lies within a live allocation
    fn contains(&self, addr: usize, len: usize) -> bool;
    fn occupied(&self) -> usize;
}

#[derive(Debug, Default)]
struct FreeEntries {
    sizes: BTreeMap<usize, IndexSet<usize>>, //<size,<Vec<addr>>
    addrs: BTreeMap<usize, usize>,           //<addr,size>
}

impl FreeEntries {
    fn insert(&mut self, addr: usize, size: usize) {
        self.sizes.entry(size).or_default().insert(addr);
        self.addrs.insert(addr, size);
    }

    fn remove(&mut self, addr: usize, size: usize) {
        self.addrs.remove(&addr);
        let mut remove_size = false;
        if let Some(addrs) = self.sizes.get_mut(&size) {
            addrs.remove(&addr);
            remove_size = addrs.is_empty();
        }
        if remove_size {
            self.sizes.remove(&size);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Block {
    start: usize,
    size: usize,
}

/// Best-fit allocator over a free list ordered by size, coalescing neighbours on free
#[derive(Debug)]
pub struct BTreeAlloc {
    free_entries: Mutex<FreeEntries>,
    //aligned address handed out -> the block backing it
    allocated: Mutex<BTreeMap<usize, Block>>,
    start_addr: usize,
    max_size: usize,
    id: String,
}

impl BTreeAlloc {
    pub fn new(id: impl Into<String>) -> BTreeAlloc {
        BTreeAlloc {
            free_entries: Mutex::new(FreeEntries::default()),
            allocated: Mutex::new(BTreeMap::new()),
            start_addr: 0,
            max_size: 0,
            id: id.into(),
        }
    }
}

impl WindowAlloc for BTreeAlloc {
    fn init(&mut self, start_addr: usize, size: usize) {
        self.start_addr = start_addr;
        self.max_size = size;
        let mut free_entries = self.free_entries.lock();
        *free_entries = FreeEntries::default();
        free_entries.insert(start_addr, size);
    }

    fn try_malloc(&self, size: usize, align: usize) -> Option<usize> {
        let align = align.max(1);
        if !align.is_power_of_two() {
            return None;
        }
        //over allocate so any block start can be aligned
        let needed = size.max(1) + align - 1;
        let mut free_entries = self.free_entries.lock();
        let (free_size, addr) = {
            let (free_size, addrs) = free_entries.sizes.range(needed..).next()?;
            (*free_size, *addrs.first()?)
        };
        free_entries.remove(addr, free_size);
        if free_size > needed {
            free_entries.insert(addr + needed, free_size - needed);
        }
        drop(free_entries);
        let aligned = (addr + align - 1) & !(align - 1);
        self.allocated.lock().insert(
            aligned,
            Block {
                start: addr,
                size: needed,
            },
        );
        tracing::trace!("{} malloc {:x} ({} bytes)", self.id, aligned, size);
        Some(aligned)
    }

    fn free(&self, addr: usize) -> DartResult<()> {
        let block = match self.allocated.lock().remove(&addr) {
            Some(block) => block,
            None => {
                tracing::debug!("{} illegal free, addr {:x} not allocated", self.id, addr);
                return Err(DartError::NotFound);
            }
        };
        let mut temp_addr = block.start;
        let mut temp_size = block.size;
        let mut free_entries = self.free_entries.lock();
        if let Some((faddr, fsize)) = free_entries.addrs.range(..block.start).next_back() {
            if faddr + fsize == block.start {
                let (faddr, fsize) = (*faddr, *fsize);
                free_entries.remove(faddr, fsize);
                temp_addr = faddr;
                temp_size += fsize;
            }
        }
        if let Some((faddr, fsize)) = free_entries.addrs.range(block.start..).next() {
            if temp_addr + temp_size == *faddr {
                let (faddr, fsize) = (*faddr, *fsize);
                free_entries.remove(faddr, fsize);
                temp_size += fsize;
            }
        }
        free_entries.insert(temp_addr, temp_size);
        Ok(())
    }

    fn contains(&self, addr: usize, len: usize) -> bool {
        let allocated = self.allocated.lock();
        match allocated.range(..=addr).next_back() {
            Some((_, block)) => addr
                .checked_add(len)
                .map_or(false, |end| end <= block.start + block.size),
            None => false,
        }
    }

    fn occupied(&self) -> usize {
        self.allocated.lock().values().map(|b| b.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(size: usize) -> BTreeAlloc {
        let mut alloc = BTreeAlloc::new("test");
        alloc.init(4096, size);
        alloc
    }

    #[test]
    fn alloc_free_coalesce() {
        let alloc = window(256);
        let a = alloc.try_malloc(64, 8).unwrap();
        let b = alloc.try_malloc(64, 8).unwrap();
        let c = alloc.try_malloc(64, 8).unwrap();
        assert!(a % 8 == 0 && b % 8 == 0 && c % 8 == 0);
        assert!(alloc.contains(b, 64));
        alloc.free(b).unwrap();
        assert!(!alloc.contains(b, 1));
        alloc.free(a).unwrap();
        alloc.free(c).unwrap();
        assert_eq!(alloc.occupied(), 0);
        //everything coalesced back into one block
        assert!(alloc.try_malloc(200, 8).is_some());
    }

    #[test]
    fn exhaustion_and_bad_free() {
        let alloc = window(128);
        assert!(alloc.try_malloc(256, 1).is_none());
        assert!(alloc.try_malloc(16, 3).is_none());
        assert_eq!(alloc.free(1), Err(DartError::NotFound));
    }

    #[test]
    fn alignment() {
        let alloc = window(1024);
        let _ = alloc.try_malloc(3, 1).unwrap();
        let b = alloc.try_malloc(8, 64).unwrap();
        assert_eq!(b % 64, 0);
        alloc.free(b).unwrap();
    }
}
