//! Node locality queries used to size and place the worker pool.
use core_affinity::CoreId;

/// What the runtime needs to know about the node it runs on
pub trait Locality: Send + Sync {
    /// Number of physical cores available to this process
    fn num_cores(&self) -> usize;
    /// Hardware threads per core
    fn threads_per_core(&self) -> usize;
    /// Cores worker threads can be pinned to
    fn core_ids(&self) -> Vec<CoreId>;

    /// Default worker count: one per core, or one per hardware thread with `max_smt`
    fn default_threads(&self, max_smt: bool) -> usize {
        let per_core = if max_smt { self.threads_per_core() } else { 1 };
        (self.num_cores() * per_core).max(1)
    }
}

/// Locality derived from what the standard library and the OS affinity mask report.
/// Every logical cpu is treated as its own core.
#[derive(Debug, Clone, Default)]
pub struct HostLocality;

impl Locality for HostLocality {
    fn num_cores(&self) -> usize {
        match std::thread::available_parallelism() {
            Ok(n) => n.into(),
            Err(_) => 1,
        }
    }

    fn threads_per_core(&self) -> usize {
        1
    }

    fn core_ids(&self) -> Vec<CoreId> {
        match core_affinity::get_core_ids() {
            Some(ids) if !ids.is_empty() => ids,
            _ => vec![CoreId { id: 0 }],
        }
    }
}
