// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tasks: a continuation plus its scheduling state.
//!
//! A task is shared between the arena, run queues, the carrier it is
//! mounted on and every waker handed out for it. State transitions go
//! through `transition`, a CAS on an `AtomicU8`. Mount, unmount, pin and
//! finish additionally happen under the carrier slot lock (see
//! `carrier.rs`), so carrier and task always agree.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::task::{Wake, Waker};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::context;
use crate::error::{RuntimeError, TaskError};
use crate::sched::carrier::CarrierId;
use crate::sched::continuation::{Continuation, SuspendReason, TaskResult};
use crate::sched::scheduler::Shared;
use crate::util::{lock, wait_timeout};

/// Scheduler-assigned task identity. Unique within one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct TaskId(u64);

impl TaskId {
    pub const fn from_raw(raw: u64) -> Self {
        TaskId(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Process-wide task identity. `TaskId`s restart in every scheduler, so
/// anything that can be shared across schedulers (lock and monitor
/// ownership) compares keys instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TaskKey {
    seq: u64,
    id: TaskId,
}

impl TaskKey {
    pub(crate) fn next(id: TaskId) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskKey {
            seq: NEXT.fetch_add(1, Ordering::Relaxed),
            id,
        }
    }

    pub(crate) fn id(self) -> TaskId {
        self.id
    }
}

/// Task lifecycle states.
///
/// ```text
/// NEW -> RUNNABLE -> MOUNTED -> { RUNNABLE | PARKED | PINNED | TERMINATED }
/// PARKED -> RUNNABLE
/// PINNED -> { RUNNABLE | PARKED }
/// ```
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum TaskState {
    New = 0,
    Runnable = 1,
    Mounted = 2,
    Parked = 3,
    Pinned = 4,
    Terminated = 5,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::New,
            1 => Self::Runnable,
            2 => Self::Mounted,
            3 => Self::Parked,
            4 => Self::Pinned,
            _ => Self::Terminated,
        }
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (New, Runnable)
                | (Runnable, Mounted)
                | (Mounted, Runnable)
                | (Mounted, Parked)
                | (Mounted, Pinned)
                | (Mounted, Terminated)
                | (Parked, Runnable)
                | (Pinned, Runnable)
                | (Pinned, Parked)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == TaskState::Terminated
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::New => "new",
            TaskState::Runnable => "runnable",
            TaskState::Mounted => "mounted",
            TaskState::Parked => "parked",
            TaskState::Pinned => "pinned",
            TaskState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a task, for introspection and the CLI report.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: Option<String>,
    pub state: TaskState,
    pub carrier: Option<CarrierId>,
    pub native_depth: usize,
    pub cancel_requested: bool,
    pub resumes: u64,
}

/// How a pinned wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PinWait {
    /// The task was signalled; resume it on the same carrier.
    Woken,
    /// The native section closed while waiting; the task may now unmount.
    Unpinned,
    ShutDown,
}

pub(crate) const NO_CARRIER: usize = usize::MAX;

pub(crate) struct Task {
    id: TaskId,
    key: TaskKey,
    name: Option<String>,
    state: AtomicU8,
    /// Set by every wake; cleared right before each resume. Closes the
    /// window between a continuation returning Pending and the task
    /// reaching PARKED.
    notified: AtomicBool,
    continuation: Mutex<Option<Continuation>>,
    resumes: AtomicUsize,
    /// Mounted carrier index, or `NO_CARRIER`.
    carrier: AtomicUsize,
    native_depth: AtomicUsize,
    cancel: CancelToken,
    outcome: Mutex<Option<TaskResult>>,
    join_wakers: Mutex<Vec<Waker>>,
    pin_lock: Mutex<()>,
    pin_cvar: Condvar,
    shared: Weak<Shared>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        name: Option<String>,
        continuation: Continuation,
        shared: Weak<Shared>,
    ) -> Self {
        Self {
            id,
            key: TaskKey::next(id),
            name,
            state: AtomicU8::new(TaskState::New as u8),
            notified: AtomicBool::new(false),
            continuation: Mutex::new(Some(continuation)),
            resumes: AtomicUsize::new(0),
            carrier: AtomicUsize::new(NO_CARRIER),
            native_depth: AtomicUsize::new(0),
            cancel: CancelToken::new(),
            outcome: Mutex::new(None),
            join_wakers: Mutex::new(Vec::new()),
            pin_lock: Mutex::new(()),
            pin_cvar: Condvar::new(),
            shared,
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn key(&self) -> TaskKey {
        self.key
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.state() == TaskState::Terminated
    }

    /// CAS `from -> to`. False if the task was not in `from`.
    pub(crate) fn transition(&self, from: TaskState, to: TaskState) -> bool {
        debug_assert!(from.can_transition_to(to), "illegal transition {from} -> {to}");
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn shared(&self) -> Option<Arc<Shared>> {
        self.shared.upgrade()
    }

    pub(crate) fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub(crate) fn carrier(&self) -> Option<CarrierId> {
        match self.carrier.load(Ordering::Acquire) {
            NO_CARRIER => None,
            idx => Some(CarrierId::new(idx)),
        }
    }

    pub(crate) fn set_carrier(&self, carrier: Option<CarrierId>) {
        let raw = carrier.map_or(NO_CARRIER, CarrierId::index);
        self.carrier.store(raw, Ordering::Release);
    }

    // ---- native sections ----

    pub(crate) fn native_depth(&self) -> usize {
        self.native_depth.load(Ordering::Acquire)
    }

    pub(crate) fn enter_native(&self) {
        self.native_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn exit_native(&self) {
        let prev = self.native_depth.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "native section underflow on {}", self.id);
        if prev == 1 && self.state() == TaskState::Pinned {
            let _guard = lock(&self.pin_lock);
            self.pin_cvar.notify_all();
        }
    }

    // ---- running ----

    /// Resume the continuation once on the calling thread.
    ///
    /// The continuation is taken out of its slot for the duration of the
    /// poll, so a concurrent resume of the same task fails instead of
    /// polling twice.
    pub(crate) fn resume(self: &Arc<Self>) -> Result<SuspendReason, RuntimeError> {
        let mut continuation = lock(&self.continuation).take().ok_or_else(|| {
            RuntimeError::invalid_state(format!("{} is already running or has terminated", self.id))
        })?;
        self.notified.store(false, Ordering::Release);
        self.resumes.fetch_add(1, Ordering::Relaxed);
        let waker = Waker::from(Arc::clone(self));
        let reason = context::enter_task(self, || continuation.resume(&waker));
        if matches!(&reason, Ok(r) if !r.is_terminal()) {
            *lock(&self.continuation) = Some(continuation);
        }
        reason
    }

    /// Drop a continuation that will never run again (shutdown).
    pub(crate) fn discard_continuation(&self) {
        let continuation = lock(&self.continuation).take();
        drop(continuation);
    }

    pub(crate) fn set_outcome(&self, outcome: TaskResult) {
        *lock(&self.outcome) = Some(outcome);
    }

    pub(crate) fn outcome(&self) -> Option<TaskResult> {
        lock(&self.outcome).clone()
    }

    pub(crate) fn failure(&self) -> Option<TaskError> {
        match &*lock(&self.outcome) {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Register a waker for termination. False if the task already
    /// terminated, in which case the waker is not stored.
    pub(crate) fn register_join(&self, waker: Waker) -> bool {
        let mut wakers = lock(&self.join_wakers);
        if self.is_terminated() {
            return false;
        }
        wakers.push(waker);
        true
    }

    pub(crate) fn take_join_wakers(&self) -> Vec<Waker> {
        std::mem::take(&mut *lock(&self.join_wakers))
    }

    pub(crate) fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            name: self.name.clone(),
            state: self.state(),
            carrier: self.carrier(),
            native_depth: self.native_depth(),
            cancel_requested: self.cancel.is_cancelled(),
            resumes: self.resumes.load(Ordering::Relaxed) as u64,
        }
    }

    // ---- waking ----

    /// Record a wake. Returns true if the caller now owns the
    /// PARKED -> RUNNABLE transition and must enqueue the task.
    pub(crate) fn claim_wake(&self) -> bool {
        self.notified.store(true, Ordering::SeqCst);
        if self.transition(TaskState::Parked, TaskState::Runnable) {
            return true;
        }
        if self.state() == TaskState::Pinned {
            let _guard = lock(&self.pin_lock);
            self.pin_cvar.notify_all();
        }
        false
    }

    /// Wake and enqueue in one step.
    pub(crate) fn signal(self: &Arc<Self>) {
        if self.claim_wake() {
            match self.shared() {
                Some(shared) => shared.enqueue(Arc::clone(self)),
                None => tracing::trace!(task = %self.id, "wake after scheduler drop"),
            }
        }
    }

    /// Called right after the task reached PARKED. A wake that landed
    /// while the continuation was still returning is replayed here.
    pub(crate) fn after_park(self: &Arc<Self>) -> bool {
        self.notified.swap(false, Ordering::SeqCst)
            && self.transition(TaskState::Parked, TaskState::Runnable)
    }

    /// Block the carrier thread while the task is pinned.
    pub(crate) fn wait_pinned(
        &self,
        recheck: Duration,
        can_unmount: impl Fn(&Task) -> bool,
        stopping: impl Fn() -> bool,
    ) -> PinWait {
        let mut guard = lock(&self.pin_lock);
        loop {
            if self.notified.swap(false, Ordering::SeqCst) {
                return PinWait::Woken;
            }
            if can_unmount(self) {
                return PinWait::Unpinned;
            }
            if stopping() {
                return PinWait::ShutDown;
            }
            guard = wait_timeout(&self.pin_cvar, guard, recheck);
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.signal();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: u64) -> Arc<Task> {
        Arc::new(Task::new(
            TaskId::from_raw(id),
            None,
            Continuation::new(async { Ok(()) }),
            Weak::new(),
        ))
    }

    #[test]
    fn lifecycle_table() {
        use TaskState::*;
        assert!(New.can_transition_to(Runnable));
        assert!(!New.can_transition_to(Mounted));
        assert!(Mounted.can_transition_to(Pinned));
        assert!(Pinned.can_transition_to(Parked));
        assert!(!Parked.can_transition_to(Mounted));
        for s in [New, Runnable, Mounted, Parked, Pinned, Terminated] {
            assert!(!Terminated.can_transition_to(s));
        }
    }

    #[test]
    fn equal_ids_get_distinct_keys() {
        let a = task(1);
        let b = task(1);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key().id(), TaskId::from_raw(1));
    }

    #[test]
    fn transition_is_compare_and_set() {
        let t = task(1);
        assert!(t.transition(TaskState::New, TaskState::Runnable));
        assert!(!t.transition(TaskState::New, TaskState::Runnable));
        assert_eq!(t.state(), TaskState::Runnable);
    }

    #[test]
    fn wake_while_mounted_is_replayed_after_park() {
        let t = task(2);
        assert!(t.transition(TaskState::New, TaskState::Runnable));
        assert!(t.transition(TaskState::Runnable, TaskState::Mounted));
        assert!(!t.claim_wake());
        assert!(t.transition(TaskState::Mounted, TaskState::Parked));
        assert!(t.after_park());
        assert_eq!(t.state(), TaskState::Runnable);
    }

    #[test]
    fn resume_after_completion_is_invalid() {
        let t = task(3);
        assert_eq!(t.resume(), Ok(SuspendReason::Completed));
        assert!(matches!(t.resume(), Err(RuntimeError::InvalidState(_))));
    }

    #[test]
    fn join_registration_refused_after_termination() {
        let t = task(4);
        assert!(t.register_join(Waker::from(Arc::clone(&t))));
        assert_eq!(t.take_join_wakers().len(), 1);
        t.state.store(TaskState::Terminated as u8, Ordering::Release);
        assert!(!t.register_join(Waker::from(Arc::clone(&t))));
    }

    #[test]
    fn display() {
        assert_eq!(TaskId::from_raw(7).to_string(), "task#7");
        assert_eq!(TaskState::Pinned.to_string(), "pinned");
    }
}
