use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Lifecycle of a task.
///
/// `Created -> Blocked -> Ready -> Running -> Done`, with `Created -> Ready` when a task
/// has no unsatisfied dependencies and `Blocked|Ready -> Cancelled` on cancellation.
#[repr(u8)]
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
    Created = 0,
    Blocked = 1,
    Ready = 2,
    Running = 3,
    Cancelled = 4,
    Done = 5,
}

impl TaskState {
    fn from_u8(val: u8) -> TaskState {
        match val {
            0 => TaskState::Created,
            1 => TaskState::Blocked,
            2 => TaskState::Ready,
            3 => TaskState::Running,
            4 => TaskState::Cancelled,
            _ => TaskState::Done,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Cancelled | TaskState::Done)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "CREATED",
            TaskState::Blocked => "BLOCKED",
            TaskState::Ready => "READY",
            TaskState::Running => "RUNNING",
            TaskState::Cancelled => "CANCELLED",
            TaskState::Done => "DONE",
        }
    }
}

/// Names a task on any unit
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskRef {
    pub unit: usize,
    pub id: u64,
}

pub(crate) type TaskBody = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
pub(crate) struct Successors {
    pub(crate) local: Vec<Arc<Task>>,
    pub(crate) remote: Vec<TaskRef>,
    /// set once the task finished, no edges are added afterwards
    pub(crate) closed: bool,
}

pub(crate) struct Task {
    pub(crate) id: u64,
    pub(crate) unit: usize,
    pub(crate) phase: u64,
    pub(crate) parent: Option<Arc<Task>>,
    state: AtomicU8,
    //unsatisfied incoming edges, plus one while the task is being created
    unresolved: AtomicI64,
    creating: AtomicBool,
    body: Mutex<Option<TaskBody>>,
    successors: Mutex<Successors>,
    cancel_requested: AtomicBool,
    pub(crate) children: AtomicUsize,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Task(unit: {}, id: {}, phase: {}, state: {:?})",
            self.unit,
            self.id,
            self.phase,
            self.state()
        )
    }
}

impl Task {
    pub(crate) fn new(
        id: u64,
        unit: usize,
        phase: u64,
        parent: Option<Arc<Task>>,
        body: TaskBody,
    ) -> Task {
        Task {
            id,
            unit,
            phase,
            parent,
            state: AtomicU8::new(TaskState::Created as u8),
            unresolved: AtomicI64::new(1),
            creating: AtomicBool::new(true),
            body: Mutex::new(Some(body)),
            successors: Mutex::new(Successors::default()),
            cancel_requested: AtomicBool::new(false),
            children: AtomicUsize::new(0),
        }
    }

    pub(crate) fn task_ref(&self) -> TaskRef {
        TaskRef {
            unit: self.unit,
            id: self.id,
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Number of incoming edges whose producers have not released this task yet
    #[cfg(test)]
    pub(crate) fn num_unresolved(&self) -> i64 {
        self.unresolved.load(Ordering::SeqCst) - self.creating.load(Ordering::SeqCst) as i64
    }

    /// Account for a dependency resolved by a message from another unit
    pub(crate) fn add_remote_dependency(&self) {
        self.unresolved.fetch_add(1, Ordering::SeqCst);
    }

    /// Creation finished; returns true if every dependency is already satisfied
    pub(crate) fn finish_creation(&self) -> bool {
        if self.unresolved.load(Ordering::SeqCst) > 1 {
            self.set_state(TaskState::Blocked);
        }
        self.creating.store(false, Ordering::SeqCst);
        self.release()
    }

    /// Resolve one dependency, returns true if this was the last one
    pub(crate) fn release(&self) -> bool {
        let prev = self.unresolved.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "{self:?} released more often than it has dependencies");
        prev == 1
    }

    /// Add `succ` as a successor, returns false if this task already finished
    pub(crate) fn add_successor(&self, succ: &Arc<Task>) -> bool {
        let mut successors = self.successors.lock();
        if successors.closed {
            return false;
        }
        succ.unresolved.fetch_add(1, Ordering::SeqCst);
        successors.local.push(succ.clone());
        true
    }

    /// Register a task on another unit to be released when this one finishes
    pub(crate) fn add_remote_successor(&self, succ: TaskRef) -> bool {
        let mut successors = self.successors.lock();
        if successors.closed {
            return false;
        }
        successors.remote.push(succ);
        true
    }

    /// Move to the final state and hand out the successors to release
    pub(crate) fn close(&self, state: TaskState) -> Successors {
        debug_assert!(state.is_terminal());
        let mut successors = self.successors.lock();
        successors.closed = true;
        self.set_state(state);
        Successors {
            local: std::mem::take(&mut successors.local),
            remote: std::mem::take(&mut successors.remote),
            closed: true,
        }
    }

    pub(crate) fn take_body(&self) -> Option<TaskBody> {
        self.body.lock().take()
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }
}

thread_local! {
    static CURRENT_TASK: RefCell<Vec<Arc<Task>>> = RefCell::new(Vec::new());
}

/// The innermost task running on this thread
pub(crate) fn current_task() -> Option<Arc<Task>> {
    CURRENT_TASK.with(|stack| stack.borrow().last().cloned())
}

pub(crate) struct RunningGuard;

impl RunningGuard {
    pub(crate) fn enter(task: &Arc<Task>) -> RunningGuard {
        CURRENT_TASK.with(|stack| stack.borrow_mut().push(task.clone()));
        RunningGuard
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        CURRENT_TASK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
