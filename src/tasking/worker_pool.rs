use super::task::Task;
use super::TaskRuntime;
use crate::config;
use crate::locality::{HostLocality, Locality};

use core_affinity::CoreId;
use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use rand::prelude::*;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

static POOL_ID: AtomicUsize = AtomicUsize::new(0);

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum PoolStatus {
    Active,
    Finished,
}

struct LocalQueue {
    pool: usize,
    context: usize,
    queue: Worker<Arc<Task>>,
}

thread_local! {
    static LOCAL_QUEUE: RefCell<Option<LocalQueue>> = RefCell::new(None);
}

/// Execution context (0 = master thread) of the calling thread within `pool`
fn local_context(pool: usize) -> Option<usize> {
    LOCAL_QUEUE.with(|q| match &*q.borrow() {
        Some(lq) if lq.pool == pool => Some(lq.context),
        _ => None,
    })
}

/// The per-unit worker pool.
///
/// Every thread (the unit's master thread included) owns a LIFO deque the others can
/// steal from; tasks released from outside a pool thread go through the shared FIFO queue.
pub(crate) struct WorkerPool {
    id: usize,
    unit: usize,
    num_threads: usize,
    shared: Arc<Injector<Arc<Task>>>,
    stealers: Arc<Vec<Stealer<Arc<Task>>>>,
    pending_queues: Mutex<Vec<Worker<Arc<Task>>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    status: Arc<AtomicU8>,
    active_cnt: Arc<AtomicUsize>,
    core_ids: Arc<Vec<CoreId>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "WorkerPool(unit {}, {} threads, {} shared)",
            self.unit,
            self.num_threads,
            self.shared.len()
        )
    }
}

impl WorkerPool {
    /// Create the queues for `num_threads` contexts and adopt the calling thread as context 0
    pub(crate) fn new(unit: usize, num_threads: usize) -> WorkerPool {
        let num_threads = num_threads.max(1);
        let queues: Vec<Worker<Arc<Task>>> = (0..num_threads).map(|_| Worker::new_lifo()).collect();
        let stealers = queues.iter().map(|q| q.stealer()).collect();
        let id = POOL_ID.fetch_add(1, Ordering::Relaxed);
        let mut queues = queues.into_iter();
        if let Some(master) = queues.next() {
            LOCAL_QUEUE.with(|q| {
                *q.borrow_mut() = Some(LocalQueue {
                    pool: id,
                    context: 0,
                    queue: master,
                })
            });
        }
        WorkerPool {
            id,
            unit,
            num_threads,
            shared: Arc::new(Injector::new()),
            stealers: Arc::new(stealers),
            pending_queues: Mutex::new(queues.collect()),
            threads: Mutex::new(Vec::new()),
            status: Arc::new(AtomicU8::new(PoolStatus::Active as u8)),
            active_cnt: Arc::new(AtomicUsize::new(0)),
            core_ids: Arc::new(HostLocality.core_ids()),
        }
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Context id of the calling thread, 0 for threads outside the pool
    pub(crate) fn context(&self) -> usize {
        local_context(self.id).unwrap_or(0)
    }

    fn pin(&self, context: usize) {
        if config().thread_affinity && !self.core_ids.is_empty() {
            let core = self.core_ids[(self.unit * self.num_threads + context) % self.core_ids.len()];
            core_affinity::set_for_current(core);
            if config().thread_affinity_verbose {
                tracing::info!("unit {} context {} pinned to core {:?}", self.unit, context, core);
            }
        }
    }

    /// Spawn the worker threads, they stop once the runtime is gone or the pool shut down
    pub(crate) fn start(&self, runtime: Weak<TaskRuntime>) {
        self.pin(0);
        let queues = std::mem::take(&mut *self.pending_queues.lock());
        let mut threads = self.threads.lock();
        for (i, queue) in queues.into_iter().enumerate() {
            let context = i + 1;
            let runtime = runtime.clone();
            let pool_id = self.id;
            let status = self.status.clone();
            let active_cnt = self.active_cnt.clone();
            let builder = thread::Builder::new().name(format!("dart-{}-worker-{}", self.unit, context));
            let handle = builder.spawn(move || {
                LOCAL_QUEUE.with(|q| {
                    *q.borrow_mut() = Some(LocalQueue {
                        pool: pool_id,
                        context,
                        queue,
                    })
                });
                active_cnt.fetch_add(1, Ordering::SeqCst);
                if let Some(rt) = runtime.upgrade() {
                    rt.pool.pin(context);
                }
                let backoff = Backoff::new();
                while status.load(Ordering::SeqCst) == PoolStatus::Active as u8 {
                    let Some(rt) = runtime.upgrade() else {
                        break;
                    };
                    rt.comm_progress();
                    match rt.pool.find_task() {
                        Some(task) => {
                            backoff.reset();
                            rt.execute(task);
                        }
                        None => {
                            drop(rt);
                            if backoff.is_completed() {
                                thread::park_timeout(Duration::from_micros(100));
                            } else {
                                backoff.snooze();
                            }
                        }
                    }
                }
                LOCAL_QUEUE.with(|q| q.borrow_mut().take());
                active_cnt.fetch_sub(1, Ordering::SeqCst);
            });
            match handle {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    tracing::error!("unit {} failed to spawn worker {}: {err}", self.unit, context)
                }
            }
        }
        tracing::debug!("unit {} started {} workers", self.unit, threads.len());
    }

    /// Queue a ready task, on the caller's own deque when it is a thread of this pool
    pub(crate) fn push(&self, task: Arc<Task>) {
        let pushed = LOCAL_QUEUE.with(|q| match &*q.borrow() {
            Some(lq) if lq.pool == self.id => {
                lq.queue.push(task.clone());
                true
            }
            _ => false,
        });
        if !pushed {
            self.shared.push(task);
        }
    }

    /// Next task for the calling thread: own deque, shared queue, then a random victim
    pub(crate) fn find_task(&self) -> Option<Arc<Task>> {
        let own = LOCAL_QUEUE.with(|q| match &*q.borrow() {
            Some(lq) if lq.pool == self.id => Some(lq.queue.pop().or_else(|| {
                std::iter::repeat_with(|| self.shared.steal_batch_and_pop(&lq.queue))
                    .find(|s| !s.is_retry())
                    .and_then(|s| s.success())
            })),
            _ => None,
        });
        let task = match own {
            Some(task) => task,
            None => loop {
                match self.shared.steal() {
                    Steal::Retry => continue,
                    Steal::Success(task) => break Some(task),
                    Steal::Empty => break None,
                }
            },
        };
        task.or_else(|| self.steal())
    }

    fn steal(&self) -> Option<Arc<Task>> {
        if self.stealers.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        let start = rng.gen_range(0..self.stealers.len());
        (0..self.stealers.len())
            .map(|i| &self.stealers[(start + i) % self.stealers.len()])
            .find_map(|s| loop {
                match s.steal() {
                    Steal::Retry => continue,
                    Steal::Success(task) => break Some(task),
                    Steal::Empty => break None,
                }
            })
    }

    /// Stop and join the worker threads
    pub(crate) fn shutdown(&self) {
        self.status.store(PoolStatus::Finished as u8, Ordering::SeqCst);
        let threads = std::mem::take(&mut *self.threads.lock());
        let me = thread::current().id();
        for handle in threads {
            if handle.thread().id() == me {
                continue;
            }
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::error!("unit {} worker thread panicked", self.unit);
            }
        }
        LOCAL_QUEUE.with(|q| {
            let mut q = q.borrow_mut();
            if matches!(&*q, Some(lq) if lq.pool == self.id) {
                q.take();
            }
        });
        tracing::debug!(
            "unit {} worker pool shut down, {} still active",
            self.unit,
            self.active_cnt.load(Ordering::SeqCst)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: u64) -> Arc<Task> {
        Arc::new(Task::new(id, 0, 0, None, Box::new(|| {})))
    }

    #[test]
    fn master_deque_is_lifo() {
        let pool = WorkerPool::new(0, 2);
        assert_eq!(pool.context(), 0);
        pool.push(task(1));
        pool.push(task(2));
        assert_eq!(pool.find_task().unwrap().id, 2);
        assert_eq!(pool.find_task().unwrap().id, 1);
        assert!(pool.find_task().is_none());
        pool.shutdown();
    }

    #[test]
    fn foreign_threads_use_shared_queue() {
        let pool = Arc::new(WorkerPool::new(0, 1));
        {
            let pool = pool.clone();
            thread::spawn(move || {
                pool.push(task(7));
                pool.push(task(8));
            })
            .join()
            .unwrap();
        }
        assert_eq!(pool.shared.len(), 2);
        assert_eq!(pool.find_task().unwrap().id, 7);
        assert_eq!(pool.find_task().unwrap().id, 8);
        pool.shutdown();
    }
}
