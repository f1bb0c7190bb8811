// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fair reentrant lock for tasks.
//!
//! Ownership is per task, not per carrier. A contended `lock` parks the
//! task and frees its carrier. `unlock` hands the lock straight to the
//! oldest waiter, which becomes holder before it is even resumed, so
//! acquisition order equals arrival order.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use super::{wake_one, Blocker, Parking, PrimitiveId, PrimitiveKind, WaitQueue, Waiter};
use crate::context;
use crate::error::RuntimeError;
use crate::sched::task::{TaskId, TaskKey};
use crate::util::lock;

#[derive(Default)]
struct LockState {
    holder: Option<TaskKey>,
    holds: usize,
    waiters: WaitQueue,
}

pub struct ReentrantLock {
    id: PrimitiveId,
    state: Mutex<LockState>,
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReentrantLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ReentrantLock")
            .field("id", &self.id)
            .field("holder", &state.holder)
            .field("holds", &state.holds)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

impl ReentrantLock {
    pub fn new() -> Self {
        Self {
            id: PrimitiveId::next(),
            state: Mutex::new(LockState::default()),
        }
    }

    pub fn blocker(&self) -> Blocker {
        Blocker::new(PrimitiveKind::Lock, self.id)
    }

    /// Acquire, parking the current task while another task holds it.
    pub fn lock(&self) -> Lock<'_> {
        self.acquire(None)
    }

    /// Acquire or give up with `Timeout` at `deadline`.
    pub fn lock_until(&self, deadline: Instant) -> Lock<'_> {
        self.acquire(Some(deadline))
    }

    pub fn lock_timeout(&self, timeout: Duration) -> Lock<'_> {
        self.acquire(Some(Instant::now() + timeout))
    }

    fn acquire(&self, deadline: Option<Instant>) -> Lock<'_> {
        Lock {
            lock: self,
            parking: Parking::new(self.blocker(), deadline),
            done: false,
        }
    }

    /// Acquire without waiting. `Ok(false)` if another task holds it.
    pub fn try_lock(&self) -> Result<bool, RuntimeError> {
        let me = context::current_key().ok_or(RuntimeError::NotInTask("ReentrantLock::try_lock"))?;
        Ok(lock(&self.state).take_for(me))
    }

    /// Release one hold. The last release hands the lock to the oldest
    /// waiter. Fails with `InvalidState` if the caller isn't the holder.
    pub fn unlock(&self) -> Result<(), RuntimeError> {
        let me = context::current_key().ok_or(RuntimeError::NotInTask("ReentrantLock::unlock"))?;
        let next = {
            let mut state = lock(&self.state);
            if state.holder != Some(me) {
                return Err(RuntimeError::invalid_state(format!(
                    "{} does not hold {}",
                    me.id(),
                    self.blocker()
                )));
            }
            state.holds -= 1;
            if state.holds > 0 {
                return Ok(());
            }
            state.hand_off()
        };
        if let Some(waiter) = next {
            tracing::trace!(lock = %self.blocker(), to = ?waiter.task_id(), "handoff");
            wake_one(waiter);
        }
        Ok(())
    }

    pub fn holder(&self) -> Option<TaskId> {
        lock(&self.state).holder.map(TaskKey::id)
    }

    pub fn is_locked(&self) -> bool {
        lock(&self.state).holder.is_some()
    }

    /// Holds of the current task (0 if it isn't the holder).
    pub fn hold_count(&self) -> usize {
        let state = lock(&self.state);
        match context::current_key() {
            Some(me) if state.holder == Some(me) => state.holds,
            _ => 0,
        }
    }

    pub fn is_held_by_current(&self) -> bool {
        self.hold_count() > 0
    }

    /// Tasks parked on this lock, oldest first.
    pub fn queued(&self) -> Vec<TaskId> {
        lock(&self.state).waiters.tasks()
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.state).waiters.len()
    }

    fn withdraw(&self, waiter: &Arc<Waiter>) -> bool {
        lock(&self.state).waiters.withdraw(waiter)
    }

    /// A granted waiter went away before observing the grant.
    fn release_grant(&self, waiter: &Arc<Waiter>) {
        let next = {
            let mut state = lock(&self.state);
            if state.holder.is_none() || state.holder != waiter.task_key() {
                return;
            }
            state.hand_off()
        };
        if let Some(next) = next {
            wake_one(next);
        }
    }
}

impl LockState {
    fn take_for(&mut self, me: TaskKey) -> bool {
        match self.holder {
            Some(holder) if holder == me => {
                self.holds += 1;
                true
            }
            Some(_) => false,
            None => {
                self.holder = Some(me);
                self.holds = 1;
                true
            }
        }
    }

    /// Pass ownership to the oldest waiter, or leave the lock free.
    fn hand_off(&mut self) -> Option<Arc<Waiter>> {
        let next = self.waiters.grant_next();
        self.holder = next.as_ref().and_then(|w| w.task_key());
        self.holds = usize::from(self.holder.is_some());
        next
    }
}

/// Future returned by [`ReentrantLock::lock`] and its timed variants.
#[must_use = "futures do nothing unless awaited"]
pub struct Lock<'a> {
    lock: &'a ReentrantLock,
    parking: Parking,
    done: bool,
}

impl Future for Lock<'_> {
    type Output = Result<(), RuntimeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(Err(RuntimeError::invalid_state(
                "lock future polled after completion",
            )));
        }
        let owner = this.lock;
        if this.parking.waiter().is_some() {
            let result = ready!(this.parking.poll_queued(cx, |w| owner.withdraw(w)));
            this.done = true;
            return Poll::Ready(result);
        }

        let Some(me) = context::current_key() else {
            this.done = true;
            return Poll::Ready(Err(RuntimeError::NotInTask("ReentrantLock::lock")));
        };
        if lock(&owner.state).take_for(me) {
            this.done = true;
            return Poll::Ready(Ok(()));
        }
        if let Some(early) = this.parking.before_queue() {
            this.done = early.is_ready();
            return early;
        }

        let waiter = Waiter::new(cx);
        {
            let mut state = lock(&owner.state);
            if state.take_for(me) {
                this.done = true;
                return Poll::Ready(Ok(()));
            }
            state.waiters.push(Arc::clone(&waiter));
        }
        this.parking.park(waiter, cx)
    }
}

impl Drop for Lock<'_> {
    fn drop(&mut self) {
        if let Some(waiter) = self.parking.take_pending() {
            if !self.lock.withdraw(&waiter) {
                self.lock.release_grant(&waiter);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_a_task() {
        let l = ReentrantLock::new();
        assert_eq!(l.try_lock(), Err(RuntimeError::NotInTask("ReentrantLock::try_lock")));
        assert_eq!(l.unlock(), Err(RuntimeError::NotInTask("ReentrantLock::unlock")));
        assert!(!l.is_locked());
        assert_eq!(l.hold_count(), 0);
    }

    #[test]
    fn reentry_counts_holds() {
        let mut state = LockState::default();
        // Same id, different schedulers.
        let a = TaskKey::next(TaskId::from_raw(1));
        let b = TaskKey::next(TaskId::from_raw(1));
        assert!(state.take_for(a));
        assert!(state.take_for(a));
        assert_eq!(state.holds, 2);
        assert!(!state.take_for(b));
        state.holds = 1;
        assert!(state.hand_off().is_none());
        assert_eq!(state.holder, None);
        assert!(state.take_for(b));
    }
}
