//! Team-wide queue lock in the style of Mellor-Crummey and Scott.
//!
//! Every member of the team owns three 64-bit slots in a segment of the team:
//! `tail` (only used at team unit 0), `next` and `granted`. Slots refer to units by
//! their team-relative id plus one, zero meaning "nobody". Waiting units spin on
//! their own `granted` slot, so the lock is handed over in FIFO order.
use crate::dart_world::Dart;
use crate::datatype::DartOp;
use crate::error::{DartError, DartResult};
use crate::gptr::GlobalPtr;
use crate::team::TeamId;
use crate::warnings::DeadlockTimer;

use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicBool, Ordering};

const TAIL: i64 = 0;
const NEXT: i64 = 1;
const GRANTED: i64 = 2;
const SLOT_BYTES: i64 = std::mem::size_of::<i64>() as i64;
const NUM_SLOTS: usize = 3;

/// A lock shared by the members of a team
#[derive(Debug)]
pub struct TeamLock {
    dart: Dart,
    team: TeamId,
    base: GlobalPtr,
    /// team-relative id of the calling unit, plus one
    me: i64,
    held: AtomicBool,
}

impl Dart {
    /// Create a lock over `team`, collective over `team`
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn team_lock_init(&self, team: TeamId) -> DartResult<TeamLock> {
        let base = self.team_memalloc_aligned(team, NUM_SLOTS * SLOT_BYTES as usize)?;
        let me = self.team_myid(team)? as i64 + 1;
        Ok(TeamLock {
            dart: self.clone(),
            team,
            base,
            me,
            held: AtomicBool::new(false),
        })
    }
}

impl TeamLock {
    pub fn team(&self) -> TeamId {
        self.team
    }

    /// Whether the calling unit holds the lock
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    fn slot(&self, owner: i64, which: i64) -> DartResult<GlobalPtr> {
        self.base
            .with_unit((owner - 1) as usize)?
            .offset_by(which * SLOT_BYTES)
    }

    fn load(&self, owner: i64, which: i64) -> DartResult<i64> {
        self.dart
            .fetch_and_op(self.slot(owner, which)?, 0i64, DartOp::NoOp)
    }

    fn swap(&self, owner: i64, which: i64, value: i64) -> DartResult<i64> {
        self.dart
            .fetch_and_op(self.slot(owner, which)?, value, DartOp::Replace)
    }

    fn reset_own_slots(&self) -> DartResult<()> {
        self.swap(self.me, NEXT, 0)?;
        self.swap(self.me, GRANTED, 0)?;
        Ok(())
    }

    fn spin_until(&self, what: &'static str, mut cond: impl FnMut() -> DartResult<bool>) -> DartResult<()> {
        let mut timer = DeadlockTimer::new(what);
        let backoff = Backoff::new();
        while !cond()? {
            self.dart.progress()?;
            backoff.snooze();
            timer.check();
        }
        Ok(())
    }

    /// Block until the lock is granted to the calling unit
    #[tracing::instrument(skip_all, level = "trace")]
    pub fn acquire(&self) -> DartResult<()> {
        if self.is_held() {
            return Err(DartError::Inval);
        }
        self.reset_own_slots()?;
        let pred = self.swap(1, TAIL, self.me)?;
        if pred != 0 {
            self.swap(pred, NEXT, self.me)?;
            self.spin_until("lock acquire", || Ok(self.load(self.me, GRANTED)? != 0))?;
        }
        self.held.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Take the lock if nobody holds or waits for it, never blocks
    pub fn try_acquire(&self) -> DartResult<bool> {
        if self.is_held() {
            return Err(DartError::Inval);
        }
        self.reset_own_slots()?;
        let tail = self
            .dart
            .compare_and_swap(self.slot(1, TAIL)?, self.me, 0i64)?;
        let acquired = tail == 0;
        self.held.store(acquired, Ordering::SeqCst);
        Ok(acquired)
    }

    /// Hand the lock to the next waiting unit, or leave it free
    #[tracing::instrument(skip_all, level = "trace")]
    pub fn release(&self) -> DartResult<()> {
        if !self.is_held() {
            return Err(DartError::Inval);
        }
        self.dart.flush_all()?;
        let mut next = self.load(self.me, NEXT)?;
        if next == 0 {
            let tail = self
                .dart
                .compare_and_swap(self.slot(1, TAIL)?, 0i64, self.me)?;
            if tail == self.me {
                self.held.store(false, Ordering::SeqCst);
                return Ok(());
            }
            // a successor swapped itself into the tail but has not linked in yet
            self.spin_until("lock release", || {
                next = self.load(self.me, NEXT)?;
                Ok(next != 0)
            })?;
        }
        self.swap(next, GRANTED, 1)?;
        self.held.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Release the lock's memory, collective over the team. The lock must not be held.
    pub fn free(self) -> DartResult<()> {
        if self.is_held() {
            return Err(DartError::Inval);
        }
        self.dart.team_memfree(self.base)
    }
}
