//! Active messages carrying dependencies between tasks on different units.
use super::dephash::DepKey;
use super::task::TaskRef;
use super::TaskRuntime;
use crate::error::DartResult;
use crate::transport::{AmId, CommAm};
use crate::{deserialize, serialize};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;

pub(crate) const REMOTE_DEP_REQUEST: AmId = 1;
pub(crate) const REMOTE_DEP_RELEASE: AmId = 2;
pub(crate) const REMOTE_DIRECT_DEP: AmId = 3;
pub(crate) const REMOTE_CANCEL: AmId = 4;

/// `origin` waits for the latest writer of `key` created in a phase not after `phase`
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub(crate) struct DepRequest {
    pub(crate) origin: TaskRef,
    pub(crate) key: DepKey,
    pub(crate) phase: u64,
}

/// One remote dependency of `task` is satisfied
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub(crate) struct DepRelease {
    pub(crate) task: u64,
}

/// `origin` waits for task `target` of the receiving unit
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub(crate) struct DirectDep {
    pub(crate) origin: TaskRef,
    pub(crate) target: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub(crate) struct DepCancel {
    pub(crate) task: u64,
}

impl TaskRuntime {
    pub(crate) fn register_handlers(self: &Arc<Self>) {
        self.register::<DepRequest>(REMOTE_DEP_REQUEST, |rt, src, msg| rt.handle_request(src, msg));
        self.register::<DepRelease>(REMOTE_DEP_RELEASE, |rt, src, msg| rt.handle_release(src, msg));
        self.register::<DirectDep>(REMOTE_DIRECT_DEP, |rt, src, msg| rt.handle_direct(src, msg));
        self.register::<DepCancel>(REMOTE_CANCEL, |rt, src, msg| rt.handle_cancel(src, msg));
    }

    fn register<M: DeserializeOwned + 'static>(
        self: &Arc<Self>,
        id: AmId,
        handler: fn(&Arc<TaskRuntime>, usize, M),
    ) {
        let weak = Arc::downgrade(self);
        self.comm.register_handler(
            id,
            Arc::new(move |src, payload| {
                let Some(rt) = weak.upgrade() else {
                    return;
                };
                match deserialize::<M>(payload) {
                    Ok(msg) => handler(&rt, src, msg),
                    Err(err) => rt.fatal(&format!("malformed message {id} from unit {src}: {err}")),
                }
            }),
        );
    }

    pub(crate) fn send_msg<M: Serialize>(&self, unit: usize, id: AmId, msg: &M) -> DartResult<()> {
        let payload = serialize(msg)?;
        self.comm.request_send(unit, id, payload)
    }

    /// Sending a protocol message must not fail, the dependency graph would never drain
    pub(crate) fn send_or_abort<M: Serialize + std::fmt::Debug>(&self, unit: usize, id: AmId, msg: &M) {
        if let Err(err) = self.send_msg(unit, id, msg) {
            self.fatal(&format!("failed to send {msg:?} to unit {unit}: {err}"));
        }
    }

    fn handle_request(self: &Arc<Self>, src: usize, req: DepRequest) {
        tracing::trace!("unit {} dep request {:?} from {}", self.unit, req, src);
        {
            let mut phases = self.phases.lock();
            if !phases.matchable(req.phase) {
                phases.deferred_requests.push(req);
                return;
            }
        }
        self.match_request(req);
    }

    /// Attach the requesting task to the matching writer, or release it right away
    pub(crate) fn match_request(&self, req: DepRequest) {
        match self.dephash.latest_producer(&req.key, req.phase) {
            Some(producer) if producer.add_remote_successor(req.origin) => {
                tracing::trace!("unit {} {:?} waits for {:?}", self.unit, req.origin, producer);
            }
            _ => self.send_or_abort(
                req.origin.unit,
                REMOTE_DEP_RELEASE,
                &DepRelease { task: req.origin.id },
            ),
        }
    }

    fn handle_release(self: &Arc<Self>, src: usize, msg: DepRelease) {
        tracing::trace!("unit {} release of task {} from {}", self.unit, msg.task, src);
        match self.lookup(msg.task) {
            Some(task) => self.release(&task),
            None => self.fatal(&format!("release for unknown task {} from unit {src}", msg.task)),
        }
    }

    fn handle_direct(self: &Arc<Self>, src: usize, msg: DirectDep) {
        tracing::trace!("unit {} direct dep {:?} from {}", self.unit, msg, src);
        let attached = match self.lookup(msg.target) {
            Some(target) => target.add_remote_successor(msg.origin),
            None => false,
        };
        if !attached {
            self.send_or_abort(
                msg.origin.unit,
                REMOTE_DEP_RELEASE,
                &DepRelease { task: msg.origin.id },
            );
        }
    }

    fn handle_cancel(self: &Arc<Self>, src: usize, msg: DepCancel) {
        tracing::debug!("unit {} cancel of task {} from {}", self.unit, msg.task, src);
        if let Some(task) = self.lookup(msg.task) {
            task.request_cancel();
        }
    }
}
