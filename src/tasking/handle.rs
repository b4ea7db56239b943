use super::task::{Task, TaskRef, TaskState};
use super::TaskRuntime;
use crate::error::{DartError, DartResult};

use parking_lot::Mutex;
use std::sync::Arc;

/// Handle to a task created with [crate::Dart::create_task_handle].
///
/// Waiting runs other ready tasks on the calling thread until the task finished.
#[must_use = "a task handle does nothing unless waited on or tested"]
pub struct TaskHandle<R> {
    task: Arc<Task>,
    result: Arc<Mutex<Option<R>>>,
    runtime: Arc<TaskRuntime>,
}

impl<R> std::fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskHandle({:?})", self.task)
    }
}

impl<R: Send + 'static> TaskHandle<R> {
    pub(crate) fn new(
        task: Arc<Task>,
        result: Arc<Mutex<Option<R>>>,
        runtime: Arc<TaskRuntime>,
    ) -> TaskHandle<R> {
        TaskHandle {
            task,
            result,
            runtime,
        }
    }

    pub fn task_ref(&self) -> TaskRef {
        self.task.task_ref()
    }

    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    /// Progress incoming messages once and report whether the task finished. Never runs tasks.
    pub fn test(&self) -> bool {
        self.runtime.comm_progress();
        self.task.state().is_terminal()
    }

    /// Block until the task is done or cancelled
    pub fn wait(&self) -> DartResult<()> {
        self.runtime.wait_task(&self.task)
    }

    /// Wait and take the value returned by the task.
    /// A cancelled task has no value and yields [DartError::NotFound].
    pub fn get(self) -> DartResult<R> {
        self.wait()?;
        self.result.lock().take().ok_or(DartError::NotFound)
    }
}
