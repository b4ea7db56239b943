//! The per-unit runtime context and the launcher creating it.
use crate::alloc::{BTreeAlloc, WindowAlloc};
use crate::config;
use crate::error::{DartError, DartResult};
use crate::group::Group;
use crate::locality::{HostLocality, Locality};
use crate::tasking::task::current_task;
use crate::tasking::TaskRuntime;
use crate::team::{TeamData, TeamRegistry, DART_TEAM_ALL};
use crate::trace::Tracer;
use crate::transport::{Backend, Comm, CommInfo, CommMem, CommShutdown, TransportFabric};

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WINDOW_ALIGN: usize = 4096;

static HOLD_IN_INIT: AtomicBool = AtomicBool::new(true);

/// Let units spinning in init because of `DART_INIT_BREAKPOINT` continue.
/// Meant to be called from a debugger (or any thread of the process).
pub fn release_init_breakpoint() {
    HOLD_IN_INIT.store(false, Ordering::SeqCst);
}

fn init_breakpoint(unit: usize) {
    if config().init_breakpoint {
        tracing::info!(
            "unit {unit} (pid {}) waiting in init, attach a debugger and call release_init_breakpoint()",
            std::process::id()
        );
        while HOLD_IN_INIT.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
        }
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Status {
    Active = 0,
    Finalized = 1,
}

pub(crate) struct DartInner {
    pub(crate) my_unit: usize,
    pub(crate) num_units: usize,
    pub(crate) comm: Arc<Comm>,
    pub(crate) teams: TeamRegistry,
    /// serves the non-collective allocations of this unit
    pub(crate) window: BTreeAlloc,
    window_base: usize,
    pub(crate) tasking: Arc<TaskRuntime>,
    pub(crate) tracer: Arc<Tracer>,
    status: AtomicU8,
}

impl Drop for DartInner {
    fn drop(&mut self) {
        if self.status.load(Ordering::SeqCst) == Status::Active as u8 {
            tracing::warn!("unit {} dropped without finalize", self.my_unit);
            self.tasking.shutdown();
        }
    }
}

/// The runtime as seen by one unit.
///
/// Cloning is cheap; every clone refers to the same unit. All primitives of the runtime
/// are methods of this type, grouped by the module implementing them.
#[derive(Clone)]
pub struct Dart {
    pub(crate) inner: Arc<DartInner>,
}

impl std::fmt::Debug for Dart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Dart(unit {} of {}, {:?})",
            self.inner.my_unit, self.inner.num_units, self.inner.comm
        )
    }
}

impl Dart {
    /// Global id of the calling unit
    pub fn my_unit(&self) -> usize {
        self.inner.my_unit
    }

    pub fn num_units(&self) -> usize {
        self.inner.num_units
    }

    /// Worker threads of this unit, the thread that initialized it included
    pub fn num_threads(&self) -> usize {
        self.inner.tasking.num_threads()
    }

    pub fn backend(&self) -> Backend {
        self.inner.comm.backend()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.status.load(Ordering::SeqCst) == Status::Active as u8
    }

    pub(crate) fn check_active(&self) -> DartResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(DartError::NotInit)
        }
    }

    /// Shut the unit down, collective over all units.
    ///
    /// Waits for every task, then releases teams and their segments, the allocation
    /// window and the transport endpoint. Every primitive fails with
    /// [DartError::NotInit] afterwards.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn finalize(&self) -> DartResult<()> {
        self.check_active()?;
        if current_task().is_some() {
            return Err(DartError::Inval);
        }
        self.inner.tasking.complete()?;
        let world = self.team_data(DART_TEAM_ALL)?;
        self.inner.comm.barrier(&world.coll)?;
        self.inner.tasking.shutdown();
        self.inner.status.store(Status::Finalized as u8, Ordering::SeqCst);
        for team in self.inner.teams.ids_leaf_first() {
            self.release_team(team)?;
        }
        self.inner.comm.free(self.inner.window_base)?;
        let written = self.inner.tracer.write_files()?;
        if !written.is_empty() {
            tracing::debug!("unit {} wrote {:?}", self.my_unit(), written);
        }
        self.inner.comm.shutdown();
        tracing::debug!("unit {} finalized", self.my_unit());
        Ok(())
    }
}

/// Configures and starts units.
///
/// ```no_run
/// let sums = dart::DartBuilder::new()
///     .with_threads(2)
///     .launch(4, |dart| dart.my_unit())
///     .unwrap();
/// assert_eq!(sums, vec![0, 1, 2, 3]);
/// ```
#[derive(Debug, Clone)]
pub struct DartBuilder {
    backend: Backend,
    num_threads: Option<usize>,
    threading: bool,
    trace: bool,
}

impl Default for DartBuilder {
    fn default() -> Self {
        DartBuilder::new()
    }
}

impl DartBuilder {
    pub fn new() -> DartBuilder {
        DartBuilder {
            backend: Default::default(),
            num_threads: config().num_threads,
            threading: config().enable_threading,
            trace: config().enable_trace,
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> DartBuilder {
        self.backend = backend;
        self
    }

    /// Worker threads per unit, including the thread running the unit
    pub fn with_threads(mut self, num_threads: usize) -> DartBuilder {
        self.num_threads = Some(num_threads.max(1));
        self
    }

    /// Without threading every task runs on the unit's own thread while it waits
    pub fn with_threading(mut self, threading: bool) -> DartBuilder {
        self.threading = threading;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> DartBuilder {
        self.trace = trace;
        self
    }

    fn threads_per_unit(&self, num_units: usize) -> usize {
        match self.num_threads {
            Some(n) => n,
            None => {
                let max_smt = config().max_smt.unwrap_or(false);
                (HostLocality.default_threads(max_smt) / num_units.max(1)).max(1)
            }
        }
    }

    /// Start a single unit on the calling thread
    pub fn build(self) -> DartResult<Dart> {
        let fabric = TransportFabric::new(self.backend, 1)?;
        let threads = self.threads_per_unit(1);
        self.init_unit(&fabric, 0, threads)
    }

    /// Run `f` on `num_units` units, each on its own thread, and finalize them afterwards.
    /// Returns the results in unit order. A panic on any unit fails the others and is
    /// propagated to the caller.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn launch<F, R>(self, num_units: usize, f: F) -> DartResult<Vec<R>>
    where
        F: Fn(&Dart) -> R + Sync,
        R: Send,
    {
        let fabric = TransportFabric::new(self.backend, num_units)?;
        let threads = self.threads_per_unit(num_units);
        let results = thread::scope(|s| {
            let mut handles = Vec::with_capacity(num_units);
            for unit in 0..num_units {
                let unit_fabric = fabric.clone();
                let f = &f;
                let builder = &self;
                let handle = thread::Builder::new()
                    .name(format!("dart-unit-{unit}"))
                    .spawn_scoped(s, move || {
                        let run = panic::catch_unwind(AssertUnwindSafe(|| {
                            let dart = builder.init_unit(&unit_fabric, unit, threads)?;
                            let res = f(&dart);
                            dart.finalize()?;
                            Ok(res)
                        }));
                        match run {
                            Ok(res) => res,
                            Err(payload) => {
                                unit_fabric.abort();
                                panic::resume_unwind(payload)
                            }
                        }
                    });
                match handle {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        tracing::error!("failed to spawn unit {unit}: {err}");
                        fabric.abort();
                    }
                }
            }
            let mut results = Vec::with_capacity(num_units);
            let mut panicked = None;
            for handle in handles {
                match handle.join() {
                    Ok(res) => results.push(res),
                    Err(payload) => {
                        panicked.get_or_insert(payload);
                    }
                }
            }
            if let Some(payload) = panicked {
                panic::resume_unwind(payload);
            }
            results
        });
        if results.len() != num_units {
            return Err(DartError::Other);
        }
        results.into_iter().collect()
    }

    /// [launch](DartBuilder::launch) with the unit count taken from `DART_NUM_UNITS`
    pub fn run<F, R>(self, f: F) -> DartResult<Vec<R>>
    where
        F: Fn(&Dart) -> R + Sync,
        R: Send,
    {
        self.launch(config().num_units, f)
    }

    fn init_unit(&self,fabric: &TransportFabric, unit: usize, threads: usize) -> DartResult<Dart> {
        init_breakpoint(unit);
        let comm = fabric.endpoint(unit)?;
        let num_units = fabric.num_units();

        let teams = TeamRegistry::new();
        let world = teams.insert(TeamData::new(
            DART_TEAM_ALL,
            None,
            Group::all(num_units),
            unit,
            0,
        )?)?;

        let window_size = config().local_window_size;
        let window_base = comm.alloc(window_size, WINDOW_ALIGN)?;
        let mut window = BTreeAlloc::new(format!("unit{unit}_window"));
        window.init(window_base, window_size);

        let tracer = Arc::new(Tracer::new(unit, self.trace, &config().trace_dir));
        let tasking = TaskRuntime::new(
            unit,
            comm.clone(),
            world.coll.clone(),
            threads,
            self.threading,
            tracer.clone(),
            config().dephash_shards,
            config().task_print_backtrace,
        );
        comm.barrier(&world.coll)?;
        tracing::debug!(
            "unit {unit} of {num_units} initialized with {} threads",
            tasking.num_threads()
        );
        Ok(Dart {
            inner: Arc::new(DartInner {
                my_unit: unit,
                num_units,
                comm,
                teams,
                window,
                window_base,
                tasking,
                tracer,
                status: AtomicU8::new(Status::Active as u8),
            }),
        })
    }
}
