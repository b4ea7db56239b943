use super::task::TaskRef;
use crate::datatype::{from_bytes, DartType};
use crate::gptr::GlobalPtr;

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DepKind {
    /// wait for the latest writer of the location
    In,
    /// wait for every earlier access, then become the latest writer
    Out,
    InOut,
    /// wait for a specific task
    Direct,
    /// wait for a prefetched copy of remote data
    CopyIn,
}

#[derive(Clone, Debug)]
pub(crate) enum DepTarget {
    Gptr(GlobalPtr),
    Task(TaskRef),
    Copyin(CopyinBuffer),
}

/// One dependency of a task being created.
///
/// Data dependencies refer to a global pointer and, unless [TaskDep::at_phase] says
/// otherwise, match accesses of the creating task's phase and earlier ones.
#[derive(Clone, Debug)]
pub struct TaskDep {
    pub(crate) kind: DepKind,
    pub(crate) target: DepTarget,
    pub(crate) phase: Option<u64>,
}

impl TaskDep {
    pub fn input(gptr: GlobalPtr) -> TaskDep {
        TaskDep {
            kind: DepKind::In,
            target: DepTarget::Gptr(gptr),
            phase: None,
        }
    }

    pub fn output(gptr: GlobalPtr) -> TaskDep {
        TaskDep {
            kind: DepKind::Out,
            target: DepTarget::Gptr(gptr),
            phase: None,
        }
    }

    pub fn inout(gptr: GlobalPtr) -> TaskDep {
        TaskDep {
            kind: DepKind::InOut,
            target: DepTarget::Gptr(gptr),
            phase: None,
        }
    }

    pub fn direct(task: TaskRef) -> TaskDep {
        TaskDep {
            kind: DepKind::Direct,
            target: DepTarget::Task(task),
            phase: None,
        }
    }

    /// Wait until `buffer` holds its data, see [crate::Dart::copyin]
    pub fn copyin(buffer: &CopyinBuffer) -> TaskDep {
        TaskDep {
            kind: DepKind::CopyIn,
            target: DepTarget::Copyin(buffer.clone()),
            phase: None,
        }
    }

    /// Match accesses up to `phase` instead of the creating task's phase
    pub fn at_phase(mut self, phase: u64) -> TaskDep {
        self.phase = Some(phase);
        self
    }

    pub fn kind(&self) -> DepKind {
        self.kind
    }
}

/// Bytes prefetched from a global pointer by a helper task.
///
/// Buffers are cached per (global pointer, phase); tasks depending on the same remote
/// data in the same phase share a single transfer. The contents are valid once a task
/// holding [TaskDep::copyin] on the buffer runs.
#[derive(Clone)]
pub struct CopyinBuffer {
    pub(crate) gptr: GlobalPtr,
    pub(crate) phase: u64,
    pub(crate) helper: TaskRef,
    pub(crate) data: Arc<RwLock<Vec<u8>>>,
}

impl std::fmt::Debug for CopyinBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CopyinBuffer({}, phase {}, {} bytes)",
            self.gptr,
            self.phase,
            self.data.read().len()
        )
    }
}

impl CopyinBuffer {
    pub fn gptr(&self) -> GlobalPtr {
        self.gptr
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    /// Interpret the prefetched bytes as values of `T`
    pub fn to_values<T: DartType>(&self) -> Vec<T> {
        from_bytes(&self.data.read())
    }
}
