use crate::warnings::DeadlockTimer;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

const NUM_STRIPES: usize = 64;

/// An active message in flight between two units
pub(crate) struct AmEnvelope {
    pub(crate) src: usize,
    pub(crate) id: u8,
    pub(crate) payload: Vec<u8>,
}

struct Board {
    contribs: Vec<Option<Vec<u8>>>,
    arrived: usize,
    collected: usize,
}

/// State shared by all units living in this process.
///
/// Each unit owns one inbox; a single queue per receiver keeps the messages of every
/// sender in submission order. Collectives meet on a board keyed by the group key and
/// the group's collective sequence number.
pub(crate) struct LocalFabric {
    num_units: usize,
    senders: Vec<Sender<AmEnvelope>>,
    receivers: Vec<Receiver<AmEnvelope>>,
    boards: Mutex<HashMap<(u64, u64), Board>>,
    windows: RwLock<Vec<BTreeMap<usize, usize>>>,
    stripes: Vec<Mutex<()>>,
    aborted: AtomicBool,
}

impl LocalFabric {
    pub(crate) fn new(num_units: usize) -> LocalFabric {
        let (senders, receivers) = (0..num_units).map(|_| unbounded()).unzip();
        LocalFabric {
            num_units,
            senders,
            receivers,
            boards: Mutex::new(HashMap::new()),
            windows: RwLock::new(vec![BTreeMap::new(); num_units]),
            stripes: (0..NUM_STRIPES).map(|_| Mutex::new(())).collect(),
            aborted: AtomicBool::new(false),
        }
    }

    pub(crate) fn num_units(&self) -> usize {
        self.num_units
    }

    /// Mark the fabric as failed, every blocking wait on it gives up
    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn register_window(&self, unit: usize, addr: usize, len: usize) {
        self.windows.write()[unit].insert(addr, len);
    }

    pub(crate) fn deregister_window(&self, unit: usize, addr: usize) -> bool {
        self.windows.write()[unit].remove(&addr).is_some()
    }

    pub(crate) fn is_accessible(&self, unit: usize, addr: usize, len: usize) -> bool {
        let windows = self.windows.read();
        match windows.get(unit) {
            Some(windows) => match windows.range(..=addr).next_back() {
                Some((start, size)) => match addr.checked_add(len) {
                    Some(end) => end <= start + size,
                    None => false,
                },
                None => false,
            },
            None => false,
        }
    }

    /// Locks serializing atomics on every word of `[addr, addr + len)`, taken in
    /// ascending stripe order
    pub(crate) fn lock_stripes(&self, addr: usize, len: usize) -> Vec<MutexGuard<'_, ()>> {
        let first = addr >> 3;
        let last = (addr + len.max(1) - 1) >> 3;
        let mut ids: Vec<usize> = (first..=last.min(first + NUM_STRIPES - 1))
            .map(|word| word % NUM_STRIPES)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter().map(|id| self.stripes[id].lock()).collect()
    }

    pub(crate) fn send(&self, unit: usize, envelope: AmEnvelope) -> bool {
        self.senders[unit].send(envelope).is_ok()
    }

    pub(crate) fn inbox(&self, unit: usize) -> &Receiver<AmEnvelope> {
        &self.receivers[unit]
    }

    /// Deposit a contribution and wait until every member has deposited theirs.
    /// `wait_fn` is called while spinning. Returns `None` if the fabric was aborted.
    pub(crate) fn rendezvous(
        &self,
        key: (u64, u64),
        num_members: usize,
        my_index: usize,
        data: &[u8],
        mut wait_fn: impl FnMut(),
    ) -> Option<Vec<Vec<u8>>> {
        {
            let mut boards = self.boards.lock();
            let board = boards.entry(key).or_insert_with(|| Board {
                contribs: vec![None; num_members],
                arrived: 0,
                collected: 0,
            });
            debug_assert!(board.contribs[my_index].is_none());
            board.contribs[my_index] = Some(data.to_vec());
            board.arrived += 1;
        }
        let mut timer = DeadlockTimer::new("collective operation");
        loop {
            {
                let mut boards = self.boards.lock();
                let mut done = false;
                let mut res = None;
                if let Some(board) = boards.get_mut(&key) {
                    if board.arrived == num_members {
                        res = Some(
                            board
                                .contribs
                                .iter()
                                .map(|c| c.clone().unwrap_or_default())
                                .collect::<Vec<_>>(),
                        );
                        board.collected += 1;
                        done = board.collected == num_members;
                    }
                }
                if done {
                    boards.remove(&key);
                }
                if res.is_some() {
                    return res;
                }
            }
            if self.is_aborted() {
                return None;
            }
            wait_fn();
            timer.check();
            std::thread::yield_now();
        }
    }
}
