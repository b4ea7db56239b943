//! Tasks with data dependencies on global memory.
//!
//! A task declares which global locations it reads ([TaskDep::input]) and writes
//! ([TaskDep::output], [TaskDep::inout]). Accesses to memory of the calling unit are
//! ordered through a local dependency hash; accesses to memory of other units are
//! resolved by the owning unit through the active messages in [remote], so a task on
//! one unit can wait for a task on another without any global synchronization.
//!
//! Tasks are created in phases. A task only runs once its phase is runnable, and a
//! remote request for phase `P` is only matched once the owner is done creating
//! tasks of phase `P` (it advanced past it or declared it runnable).
use crate::dart_world::Dart;
use crate::datatype::{as_bytes, as_bytes_mut, DartDatatype, DartOp};
use crate::error::{DartError, DartResult};
use crate::fatal;
use crate::gptr::GlobalPtr;
use crate::segment::LOCAL_SEGMENT;
use crate::trace::Tracer;
use crate::transport::{CollGroup, Comm, CommAm, CommRdma, CommShutdown};
use crate::warnings::DeadlockTimer;

use crossbeam::utils::Backoff;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) mod dephash;
mod dependency;
mod handle;
pub(crate) mod remote;
pub(crate) mod task;
mod worker_pool;

pub use dependency::{CopyinBuffer, DepKind, TaskDep};
pub use handle::TaskHandle;
pub use task::{TaskRef, TaskState};

use dephash::{DepHash, DepKey};
use remote::{DepCancel, DepRelease, DepRequest, DirectDep};
use remote::{REMOTE_CANCEL, REMOTE_DEP_RELEASE, REMOTE_DEP_REQUEST, REMOTE_DIRECT_DEP};
use task::{current_task, RunningGuard, Task};
use worker_pool::WorkerPool;

/// A dependency translated to what the runtime works with
#[derive(Debug, Clone, Copy)]
pub(crate) enum ResolvedDep {
    Data {
        key: DepKey,
        write: bool,
        phase: Option<u64>,
    },
    Direct(TaskRef),
}

struct PhaseState {
    /// phase new tasks are created in
    creation: u64,
    /// tasks of phases up to this one may run
    runnable: u64,
    /// every task of phases up to this one has been created
    declared: Option<u64>,
    deferred_tasks: Vec<Arc<Task>>,
    deferred_requests: Vec<DepRequest>,
}

impl PhaseState {
    fn matchable(&self, phase: u64) -> bool {
        phase < self.creation || self.declared.map_or(false, |d| phase <= d)
    }

    fn take_matchable(&mut self) -> Vec<DepRequest> {
        let deferred = std::mem::take(&mut self.deferred_requests);
        let (ready, deferred): (Vec<_>, Vec<_>) =
            deferred.into_iter().partition(|req| self.matchable(req.phase));
        self.deferred_requests = deferred;
        ready
    }

    fn take_runnable(&mut self) -> Vec<Arc<Task>> {
        let runnable = self.runnable;
        let deferred = std::mem::take(&mut self.deferred_tasks);
        let (ready, deferred): (Vec<_>, Vec<_>) =
            deferred.into_iter().partition(|t| t.phase <= runnable);
        self.deferred_tasks = deferred;
        ready
    }
}

/// The tasking runtime of one unit
pub(crate) struct TaskRuntime {
    unit: usize,
    comm: Arc<Comm>,
    world: CollGroup,
    pool: WorkerPool,
    dephash: DepHash,
    tasks: Mutex<HashMap<u64, Arc<Task>>>,
    next_id: AtomicU64,
    active: AtomicUsize,
    phases: Mutex<PhaseState>,
    copyins: Mutex<HashMap<(u128, u64, usize), CopyinBuffer>>,
    tracer: Arc<Tracer>,
    print_backtrace: bool,
}

impl std::fmt::Debug for TaskRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TaskRuntime(unit {}, {} active, {:?})",
            self.unit,
            self.active.load(Ordering::SeqCst),
            self.pool
        )
    }
}

impl TaskRuntime {
    /// Set up the runtime on the calling thread, which becomes execution context 0
    pub(crate) fn new(
        unit: usize,
        comm: Arc<Comm>,
        world: CollGroup,
        num_threads: usize,
        threaded: bool,
        tracer: Arc<Tracer>,
        dephash_shards: usize,
        print_backtrace: bool,
    ) -> Arc<TaskRuntime> {
        let num_threads = if threaded { num_threads.max(1) } else { 1 };
        let rt = Arc::new(TaskRuntime {
            unit,
            comm,
            world,
            pool: WorkerPool::new(unit, num_threads),
            dephash: DepHash::new(dephash_shards),
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            active: AtomicUsize::new(0),
            phases: Mutex::new(PhaseState {
                creation: 0,
                runnable: 0,
                declared: None,
                deferred_tasks: Vec::new(),
                deferred_requests: Vec::new(),
            }),
            copyins: Mutex::new(HashMap::new()),
            tracer,
            print_backtrace,
        });
        rt.register_handlers();
        if num_threads > 1 {
            rt.pool.start(Arc::downgrade(&rt));
        }
        rt
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.pool.num_threads()
    }

    pub(crate) fn comm_progress(&self) -> usize {
        self.comm.progress()
    }

    pub(crate) fn fatal(&self, msg: &str) -> ! {
        fatal::abort(self.unit, &self.comm, Some(&self.tracer), msg)
    }

    fn lookup(&self, id: u64) -> Option<Arc<Task>> {
        self.tasks.lock().get(&id).cloned()
    }

    pub(crate) fn num_active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn creation_phase(&self) -> u64 {
        self.phases.lock().creation
    }

    /// Create a task, its dependencies are registered before it can run
    pub(crate) fn create(
        self: &Arc<Self>,
        body: impl FnOnce() + Send + 'static,
        deps: &[ResolvedDep],
    ) -> Arc<Task> {
        let phase = self.creation_phase();
        let parent = current_task().filter(|p| p.unit == self.unit);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = Arc::new(Task::new(id, self.unit, phase, parent.clone(), Box::new(body)));
        if let Some(parent) = parent {
            parent.children.fetch_add(1, Ordering::SeqCst);
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        self.tasks.lock().insert(id, task.clone());
        for dep in deps {
            self.register_dep(&task, *dep);
        }
        tracing::trace!("unit {} created {:?} with {} deps", self.unit, task, deps.len());
        if task.finish_creation() {
            self.make_ready(task.clone());
        }
        task
    }

    fn register_dep(&self, task: &Arc<Task>, dep: ResolvedDep) {
        match dep {
            ResolvedDep::Data { key, write, phase } => {
                if key.unit == self.unit {
                    if write {
                        self.dephash.add_output(task, key);
                    } else {
                        self.dephash.add_input(task, key, phase.unwrap_or(task.phase));
                    }
                } else {
                    task.add_remote_dependency();
                    let req = DepRequest {
                        origin: task.task_ref(),
                        key,
                        phase: phase.unwrap_or(task.phase),
                    };
                    self.send_or_abort(key.unit, REMOTE_DEP_REQUEST, &req);
                }
            }
            ResolvedDep::Direct(target) => {
                if target.unit == self.unit {
                    if let Some(pred) = self.lookup(target.id) {
                        if !Arc::ptr_eq(&pred, task) {
                            pred.add_successor(task);
                        }
                    }
                } else {
                    task.add_remote_dependency();
                    let msg = DirectDep {
                        origin: task.task_ref(),
                        target: target.id,
                    };
                    self.send_or_abort(target.unit, REMOTE_DIRECT_DEP, &msg);
                }
            }
        }
    }

    /// Resolve one dependency of `task`
    pub(crate) fn release(&self, task: &Arc<Task>) {
        if task.release() {
            self.make_ready(task.clone());
        }
    }

    fn make_ready(&self, task: Arc<Task>) {
        {
            let mut phases = self.phases.lock();
            if task.phase > phases.runnable {
                phases.deferred_tasks.push(task);
                return;
            }
        }
        task.set_state(TaskState::Ready);
        self.pool.push(task);
    }

    /// Run (or skip, when cancelled) a ready task and release its successors
    pub(crate) fn execute(&self, task: Arc<Task>) {
        let context = self.pool.context();
        let start = self.tracer.now_us();
        let state = if task.cancel_requested() {
            TaskState::Cancelled
        } else {
            task.set_state(TaskState::Running);
            if let Some(body) = task.take_body() {
                let _running = RunningGuard::enter(&task);
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
                    if self.print_backtrace {
                        eprintln!("{}", std::backtrace::Backtrace::force_capture());
                    }
                    self.fatal(&format!("task body panicked: {}", fatal::panic_message(&*payload)));
                }
                // writes of the body become visible before any successor is released
                if let Err(err) = self.comm.flush_all() {
                    self.fatal(&format!("failed to flush task writes: {err}"));
                }
            }
            TaskState::Done
        };
        self.finish(&task, state);
        self.tracer
            .record(context, start, self.tracer.now_us(), state.as_str());
    }

    fn finish(&self, task: &Arc<Task>, state: TaskState) {
        let successors = task.close(state);
        let cancelled = state == TaskState::Cancelled;
        for succ in successors.local {
            if cancelled {
                succ.request_cancel();
            }
            self.release(&succ);
        }
        for succ in successors.remote {
            if cancelled {
                self.send_or_abort(succ.unit, REMOTE_CANCEL, &DepCancel { task: succ.id });
            }
            self.send_or_abort(succ.unit, REMOTE_DEP_RELEASE, &DepRelease { task: succ.id });
        }
        self.tasks.lock().remove(&task.id);
        if let Some(parent) = &task.parent {
            parent.children.fetch_sub(1, Ordering::SeqCst);
        }
        tracing::trace!("unit {} finished {:?}", self.unit, task);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Run other work on the calling thread until `done` holds
    pub(crate) fn help_until(
        &self,
        what: &'static str,
        mut done: impl FnMut() -> bool,
    ) -> DartResult<()> {
        let mut timer = DeadlockTimer::new(what);
        let backoff = Backoff::new();
        while !done() {
            if self.comm.is_aborted() {
                return Err(DartError::Other);
            }
            self.comm.progress();
            match self.pool.find_task() {
                Some(task) => {
                    backoff.reset();
                    self.execute(task);
                }
                None => backoff.snooze(),
            }
            timer.check();
        }
        Ok(())
    }

    /// Waiting for a task declares its phase: remote requests up to that phase are
    /// matched and its tasks may run
    pub(crate) fn wait_task(&self, task: &Arc<Task>) -> DartResult<()> {
        let undeclared = {
            let phases = self.phases.lock();
            task.phase > phases.runnable || phases.declared.map_or(true, |d| d < task.phase)
        };
        if undeclared {
            self.set_runnable(task.phase);
        }
        self.help_until("task wait", || task.state().is_terminal())
    }

    /// Run queued tasks on the calling thread until none is left
    fn drain(&self) {
        loop {
            self.comm.progress();
            match self.pool.find_task() {
                Some(task) => self.execute(task),
                None => break,
            }
        }
    }

    /// Wait for every task of every unit, collective over all units.
    /// Inside a task, wait for the children of that task only.
    pub(crate) fn complete(&self) -> DartResult<()> {
        if let Some(current) = current_task().filter(|t| t.unit == self.unit) {
            return self.help_until("task_complete", || {
                current.children.load(Ordering::SeqCst) == 0
            });
        }
        self.declare_all();
        let mut timer = DeadlockTimer::new("task_complete");
        // (tasks alive, messages sent, messages handled) summed over all units; the
        // graph has drained once two consecutive rounds see no task and equal counts
        let mut prev: Option<u64> = None;
        loop {
            self.drain();
            let (sent, handled) = self.comm.am_counts();
            let local = [self.active.load(Ordering::SeqCst) as u64, sent, handled];
            let mut global = [0u64; 3];
            self.comm.allreduce(
                &self.world,
                as_bytes(&local),
                as_bytes_mut(&mut global),
                DartOp::Sum,
                DartDatatype::ULong,
            )?;
            let quiet = global[0] == 0 && global[1] == global[2];
            if quiet && prev == Some(global[1]) {
                break;
            }
            prev = if quiet { Some(global[1]) } else { None };
            timer.check();
        }
        {
            let mut phases = self.phases.lock();
            phases.declared = None;
            phases.runnable = phases.creation;
        }
        self.dephash.clear();
        self.copyins.lock().clear();
        tracing::debug!("unit {} task_complete done", self.unit);
        Ok(())
    }

    fn declare_all(&self) {
        let (tasks, requests) = {
            let mut phases = self.phases.lock();
            phases.declared = Some(u64::MAX);
            phases.runnable = u64::MAX;
            (phases.take_runnable(), phases.take_matchable())
        };
        self.launch(tasks, requests);
    }

    fn launch(&self, tasks: Vec<Arc<Task>>, requests: Vec<DepRequest>) {
        for req in requests {
            self.match_request(req);
        }
        for task in tasks {
            task.set_state(TaskState::Ready);
            self.pool.push(task);
        }
    }

    pub(crate) fn phase_advance(&self) -> u64 {
        let (phase, requests) = {
            let mut phases = self.phases.lock();
            phases.creation += 1;
            (phases.creation, phases.take_matchable())
        };
        self.prune_copyins(phase);
        self.launch(Vec::new(), requests);
        phase
    }

    /// Copy-in buffers are only shared within their creation phase
    fn prune_copyins(&self, creation: u64) {
        self.copyins.lock().retain(|(_, phase, _), _| *phase >= creation);
    }

    /// Tasks of phases up to `phase` may run and are all created
    pub(crate) fn set_runnable(&self, phase: u64) {
        let (tasks, requests) = {
            let mut phases = self.phases.lock();
            phases.runnable = phases.runnable.max(phase);
            phases.declared = Some(phases.declared.map_or(phase, |d| d.max(phase)));
            (phases.take_runnable(), phases.take_matchable())
        };
        self.launch(tasks, requests);
    }

    /// Agree on the highest creation phase of `group` and continue after it
    pub(crate) fn resync(&self, group: &CollGroup) -> DartResult<u64> {
        let local = [self.creation_phase()];
        let mut max = [0u64];
        self.comm.allreduce(
            group,
            as_bytes(&local),
            as_bytes_mut(&mut max),
            DartOp::Max,
            DartDatatype::ULong,
        )?;
        let (phase, requests) = {
            let mut phases = self.phases.lock();
            phases.creation = phases.creation.max(max[0] + 1);
            (phases.creation, phases.take_matchable())
        };
        self.prune_copyins(phase);
        self.launch(Vec::new(), requests);
        Ok(phase)
    }

    pub(crate) fn cancel(&self, target: TaskRef) -> DartResult<()> {
        if target.unit != self.unit {
            return Err(DartError::Inval);
        }
        match self.lookup(target.id) {
            Some(task) => {
                if task.state() != TaskState::Running {
                    task.request_cancel();
                }
                Ok(())
            }
            // already finished
            None => Ok(()),
        }
    }

    /// Stop the workers, the runtime must be drained
    pub(crate) fn shutdown(&self) {
        let left = self.num_active();
        if left > 0 {
            tracing::warn!("unit {} shutting down with {} unfinished tasks", self.unit, left);
        }
        self.pool.shutdown();
        self.tasks.lock().clear();
        self.dephash.clear();
        self.copyins.lock().clear();
    }
}

impl Dart {
    pub(crate) fn tasking(&self) -> DartResult<&Arc<TaskRuntime>> {
        self.check_active()?;
        Ok(&self.inner.tasking)
    }

    /// Normalize `gptr` to the key every unit uses for the same location
    pub(crate) fn dep_key(&self, gptr: &GlobalPtr) -> DartResult<DepKey> {
        if gptr.is_null() {
            return Err(DartError::Inval);
        }
        let unit = if gptr.segment_id() == LOCAL_SEGMENT {
            gptr.unit()
        } else {
            self.team_data(gptr.team_id())?.global_unit(gptr.unit())?
        };
        if unit >= self.num_units() {
            return Err(DartError::Inval);
        }
        Ok(DepKey {
            unit,
            team: gptr.team_id().id(),
            segid: gptr.segment_id(),
            offset: gptr.addr_or_offset(),
        })
    }

    fn resolve_deps(&self, deps: &[TaskDep]) -> DartResult<Vec<ResolvedDep>> {
        deps.iter()
            .map(|dep| match &dep.target {
                dependency::DepTarget::Gptr(gptr) => Ok(ResolvedDep::Data {
                    key: self.dep_key(gptr)?,
                    write: matches!(dep.kind, DepKind::Out | DepKind::InOut),
                    phase: dep.phase,
                }),
                dependency::DepTarget::Task(task) => {
                    if task.unit >= self.num_units() {
                        return Err(DartError::Inval);
                    }
                    Ok(ResolvedDep::Direct(*task))
                }
                dependency::DepTarget::Copyin(buffer) => Ok(ResolvedDep::Direct(buffer.helper)),
            })
            .collect()
    }

    /// Create a task running `f` once all of `deps` are satisfied
    #[tracing::instrument(skip_all, level = "trace")]
    pub fn create_task<F>(&self, f: F, deps: &[TaskDep]) -> DartResult<TaskRef>
    where
        F: FnOnce() + Send + 'static,
    {
        let rt = self.tasking()?;
        let deps = self.resolve_deps(deps)?;
        Ok(rt.create(f, &deps).task_ref())
    }

    /// Like [Dart::create_task], returning a handle to wait for the result of `f`
    #[tracing::instrument(skip_all, level = "trace")]
    pub fn create_task_handle<F, R>(&self, f: F, deps: &[TaskDep]) -> DartResult<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let rt = self.tasking()?;
        let deps = self.resolve_deps(deps)?;
        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        let task = rt.create(move || *slot.lock() = Some(f()), &deps);
        Ok(TaskHandle::new(task, result, rt.clone()))
    }

    /// Wait until every task on every unit finished, collective over all units.
    /// Called from inside a task, waits for the children of that task instead.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn task_complete(&self) -> DartResult<()> {
        self.tasking()?.complete()
    }

    /// Start a new creation phase, returns its number
    pub fn phase_advance(&self) -> DartResult<u64> {
        Ok(self.tasking()?.phase_advance())
    }

    /// Declare every task of phases up to `phase` created and allow them to run
    pub fn phase_set_runnable(&self, phase: u64) -> DartResult<()> {
        self.tasking()?.set_runnable(phase);
        Ok(())
    }

    /// Collectively move the creation phase of every member of `team` past the highest one
    pub fn phase_resync(&self, team: crate::team::TeamId) -> DartResult<u64> {
        let data = self.team_data(team)?;
        self.tasking()?.resync(&data.coll)
    }

    pub fn current_phase(&self) -> DartResult<u64> {
        Ok(self.tasking()?.creation_phase())
    }

    /// The task running on the calling thread
    pub fn current_task(&self) -> Option<TaskRef> {
        current_task()
            .filter(|t| t.unit == self.my_unit())
            .map(|t| t.task_ref())
    }

    /// Cancel a task of this unit that has not started yet.
    /// Its body is skipped and the cancellation spreads to its successors.
    pub fn task_cancel(&self, task: &TaskRef) -> DartResult<()> {
        self.tasking()?.cancel(*task)
    }

    /// Prefetch `nbytes` at `gptr` into a runtime-owned buffer.
    ///
    /// The transfer waits for earlier writers of `gptr` and is shared by every caller
    /// asking for the same data in the same phase. Tasks reading the buffer depend on
    /// it with [TaskDep::copyin].
    pub fn copyin(&self, gptr: GlobalPtr, nbytes: usize) -> DartResult<CopyinBuffer> {
        let rt = self.tasking()?;
        let phase = rt.creation_phase();
        let cache_key = (gptr.to_bits(), phase, nbytes);
        if let Some(buffer) = rt.copyins.lock().get(&cache_key) {
            return Ok(buffer.clone());
        }
        let (unit, addr) = self.resolve(&gptr, nbytes)?;
        let deps = self.resolve_deps(&[TaskDep::input(gptr)])?;
        let data = Arc::new(RwLock::new(vec![0u8; nbytes]));
        let body = {
            let data = data.clone();
            let comm = self.inner.comm.clone();
            let runtime = Arc::downgrade(rt);
            move || {
                let mut buf = data.write();
                if let Err(err) = comm.get(unit, addr, &mut buf) {
                    if let Some(rt) = runtime.upgrade() {
                        rt.fatal(&format!("copyin from {gptr} failed: {err}"));
                    }
                }
            }
        };
        let helper = rt.create(body, &deps);
        let buffer = CopyinBuffer {
            gptr,
            phase,
            helper: helper.task_ref(),
            data,
        };
        rt.copyins.lock().insert(cache_key, buffer.clone());
        Ok(buffer)
    }
}
