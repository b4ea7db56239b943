//! Typed collective operations over teams, and user-level active messages.
use crate::dart_world::Dart;
use crate::datatype::{as_bytes, as_bytes_mut, DartOp, DartType};
use crate::error::{DartError, DartResult};
use crate::tasking::task::current_task;
use crate::team::{TeamData, TeamId};
use crate::transport::{AmId, CommAm};
use crate::warnings::RuntimeWarning;

use std::sync::Arc;

/// Active-message ids below this value are reserved for the runtime
pub const USER_AM_BASE: u8 = 32;

impl Dart {
    fn collective_team(&self, team: TeamId, what: &'static str) -> DartResult<Arc<TeamData>> {
        if current_task().is_some() {
            RuntimeWarning::BlockingCall(what).print();
        }
        self.team_data(team)
    }

    /// Wait until every member of `team` entered the barrier
    #[tracing::instrument(skip_all, level = "trace")]
    pub fn barrier(&self, team: TeamId) -> DartResult<()> {
        let data = self.collective_team(team, "barrier")?;
        self.inner.comm.barrier(&data.coll)
    }

    /// Copy `buf` of team-relative unit `root` into `buf` of every member
    pub fn bcast<T: DartType>(&self, team: TeamId, root: usize, buf: &mut [T]) -> DartResult<()> {
        let data = self.collective_team(team, "bcast")?;
        self.inner.comm.bcast(&data.coll, root, as_bytes_mut(buf))
    }

    /// `dst` receives the `src` of every member in team order
    pub fn allgather<T: DartType>(&self, team: TeamId, src: &[T], dst: &mut [T]) -> DartResult<()> {
        let data = self.collective_team(team, "allgather")?;
        self.inner
            .comm
            .allgather_into(&data.coll, as_bytes(src), as_bytes_mut(dst))
    }

    /// Element-wise reduction of every member's `src` into every member's `dst`
    pub fn allreduce<T: DartType>(
        &self,
        team: TeamId,
        src: &[T],
        dst: &mut [T],
        op: DartOp,
    ) -> DartResult<()> {
        let data = self.collective_team(team, "allreduce")?;
        check_reduction(op)?;
        self.inner
            .comm
            .allreduce(&data.coll, as_bytes(src), as_bytes_mut(dst), op, T::DATATYPE)
    }

    /// Like [Dart::allreduce], only `root` receives the result
    pub fn reduce<T: DartType>(
        &self,
        team: TeamId,
        root: usize,
        src: &[T],
        dst: &mut [T],
        op: DartOp,
    ) -> DartResult<()> {
        let data = self.collective_team(team, "reduce")?;
        check_reduction(op)?;
        self.inner
            .comm
            .reduce(&data.coll, root, as_bytes(src), as_bytes_mut(dst), op, T::DATATYPE)
    }

    /// `dst` at `root` receives the `src` of every member in team order
    pub fn gather<T: DartType>(
        &self,
        team: TeamId,
        root: usize,
        src: &[T],
        dst: &mut [T],
    ) -> DartResult<()> {
        let data = self.collective_team(team, "gather")?;
        self.inner
            .comm
            .gather(&data.coll, root, as_bytes(src), as_bytes_mut(dst))
    }

    /// Member `i` receives the `i`-th chunk of `src` at `root`
    pub fn scatter<T: DartType>(
        &self,
        team: TeamId,
        root: usize,
        src: &[T],
        dst: &mut [T],
    ) -> DartResult<()> {
        let data = self.collective_team(team, "scatter")?;
        self.inner
            .comm
            .scatter(&data.coll, root, as_bytes(src), as_bytes_mut(dst))
    }

    /// Register `handler` for messages sent with `id`, which must be at least [USER_AM_BASE].
    /// Handlers run inside [Dart::progress] with the sending unit and the payload.
    pub fn register_handler<F>(&self, id: u8, handler: F) -> DartResult<()>
    where
        F: Fn(usize, &[u8]) + Send + Sync + 'static,
    {
        self.check_active()?;
        if id < USER_AM_BASE {
            return Err(DartError::Inval);
        }
        self.inner.comm.register_handler(id as AmId, Arc::new(handler));
        Ok(())
    }

    /// Queue a message at `unit`. Messages between two units are handled in the order sent.
    pub fn request_send(&self, unit: usize, id: u8, payload: Vec<u8>) -> DartResult<()> {
        self.check_active()?;
        if id < USER_AM_BASE || unit >= self.num_units() {
            return Err(DartError::Inval);
        }
        self.inner.comm.request_send(unit, id as AmId, payload)
    }

    /// Handle every message queued for this unit, returns how many were handled
    pub fn progress(&self) -> DartResult<usize> {
        self.check_active()?;
        Ok(self.inner.comm.progress())
    }
}

fn check_reduction(op: DartOp) -> DartResult<()> {
    match op {
        DartOp::Replace | DartOp::NoOp => Err(DartError::Inval),
        _ => Ok(()),
    }
}
