// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task-aware synchronization primitives.
//!
//! Every blocking primitive here parks the calling task instead of the
//! carrier: waiters go into a FIFO `WaitQueue` under the primitive's own
//! lock, and the releasing side grants and wakes them after dropping it.
//! A waiter is granted at most once and a granted waiter never times out.
//!
//! `NativeMonitor` is the exception. It blocks the OS thread, like a
//! `synchronized` block, and pins the task for as long as it is held.

mod latch;
mod lock;
mod monitor;
mod signal;

pub use latch::{CountDownLatch, LatchWait};
pub use lock::{Lock, ReentrantLock};
pub use monitor::{MonitorGuard, NativeMonitor};
pub use signal::{Signal, SignalWait};

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use crate::context::{self, Suspension};
use crate::error::RuntimeError;
use crate::sched::task::{Task, TaskId, TaskKey};
use crate::sched::scheduler::Shared;
use crate::timer::{Timer, TimerKey};
use crate::util::lock;

/// Closed set of things a task can be parked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PrimitiveKind {
    Lock,
    Latch,
    Signal,
    Timer,
    Join,
    /// A future from outside this crate.
    External,
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrimitiveKind::Lock => "lock",
            PrimitiveKind::Latch => "latch",
            PrimitiveKind::Signal => "signal",
            PrimitiveKind::Timer => "timer",
            PrimitiveKind::Join => "join",
            PrimitiveKind::External => "external",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct PrimitiveId(u64);

impl PrimitiveId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        PrimitiveId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        PrimitiveId(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// The primitive a task is parked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Blocker {
    pub kind: PrimitiveKind,
    pub id: PrimitiveId,
}

impl Blocker {
    pub const fn new(kind: PrimitiveKind, id: PrimitiveId) -> Self {
        Self { kind, id }
    }

    pub const fn external() -> Self {
        Self::new(PrimitiveKind::External, PrimitiveId(0))
    }
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PrimitiveKind::External => write!(f, "external"),
            kind => write!(f, "{}#{}", kind, self.id.0),
        }
    }
}

// ---- waiters ----

const WAITING: u8 = 0;
const GRANTED: u8 = 1;
const ABANDONED: u8 = 2;

enum WakeTarget {
    Task(Arc<Task>),
    /// Waiting from a foreign executor.
    Waker(Mutex<Waker>),
}

/// One queued wait. Granted or abandoned exactly once, always under the
/// owning primitive's lock.
pub(crate) struct Waiter {
    state: AtomicU8,
    target: WakeTarget,
}

impl Waiter {
    pub(crate) fn new(cx: &Context<'_>) -> Arc<Self> {
        let target = match context::with_current(Arc::clone) {
            Some(task) => WakeTarget::Task(task),
            None => WakeTarget::Waker(Mutex::new(cx.waker().clone())),
        };
        Arc::new(Self {
            state: AtomicU8::new(WAITING),
            target,
        })
    }

    pub(crate) fn task_id(&self) -> Option<TaskId> {
        self.task_key().map(TaskKey::id)
    }

    pub(crate) fn task_key(&self) -> Option<TaskKey> {
        match &self.target {
            WakeTarget::Task(task) => Some(task.key()),
            WakeTarget::Waker(_) => None,
        }
    }

    pub(crate) fn grant(&self) -> bool {
        self.state
            .compare_exchange(WAITING, GRANTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn abandon(&self) -> bool {
        self.state
            .compare_exchange(WAITING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_granted(&self) -> bool {
        self.state.load(Ordering::Acquire) == GRANTED
    }

    fn refresh(&self, waker: &Waker) {
        if let WakeTarget::Waker(slot) = &self.target {
            let mut current = lock(slot);
            if !current.will_wake(waker) {
                *current = waker.clone();
            }
        }
    }
}

/// FIFO of waiters for one primitive.
#[derive(Default)]
pub(crate) struct WaitQueue {
    entries: VecDeque<Arc<Waiter>>,
}

impl WaitQueue {
    pub(crate) fn push(&mut self, waiter: Arc<Waiter>) {
        self.entries.push_back(waiter);
    }

    /// Grant the oldest live waiter.
    pub(crate) fn grant_next(&mut self) -> Option<Arc<Waiter>> {
        while let Some(waiter) = self.entries.pop_front() {
            if waiter.grant() {
                return Some(waiter);
            }
        }
        None
    }

    pub(crate) fn grant_all(&mut self) -> Vec<Arc<Waiter>> {
        self.entries.drain(..).filter(|w| w.grant()).collect()
    }

    /// Abandon `waiter` and drop it from the queue. False if it was
    /// already granted.
    pub(crate) fn withdraw(&mut self, waiter: &Arc<Waiter>) -> bool {
        if !waiter.abandon() {
            return false;
        }
        self.entries.retain(|w| !Arc::ptr_eq(w, waiter));
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn tasks(&self) -> Vec<TaskId> {
        self.entries.iter().filter_map(|w| w.task_id()).collect()
    }
}

/// Wake granted waiters. Must be called after the primitive's lock is
/// released. Tasks of one scheduler are re-queued as a single batch.
pub(crate) fn wake_all(waiters: Vec<Arc<Waiter>>) {
    let mut batches: Vec<(Arc<Shared>, Vec<Arc<Task>>)> = Vec::new();
    for waiter in waiters {
        match &waiter.target {
            WakeTarget::Task(task) => {
                if !task.claim_wake() {
                    continue;
                }
                let Some(shared) = task.shared() else { continue };
                match batches.iter_mut().find(|(s, _)| Arc::ptr_eq(s, &shared)) {
                    Some((_, batch)) => batch.push(Arc::clone(task)),
                    None => batches.push((shared, vec![Arc::clone(task)])),
                }
            }
            WakeTarget::Waker(slot) => lock(slot).wake_by_ref(),
        }
    }
    for (shared, batch) in batches {
        shared.enqueue_batch(batch);
    }
}

pub(crate) fn wake_one(waiter: Arc<Waiter>) {
    match &waiter.target {
        WakeTarget::Task(task) => task.signal(),
        WakeTarget::Waker(slot) => lock(slot).wake_by_ref(),
    }
}

// ---- parking ----

/// Bookkeeping for one parked wait: the queued waiter, its optional
/// deadline and the timer entry that enforces it.
pub(crate) struct Parking {
    blocker: Blocker,
    deadline: Option<Instant>,
    waiter: Option<Arc<Waiter>>,
    timer: Option<(Arc<Timer>, TimerKey)>,
}

impl Parking {
    pub(crate) fn new(blocker: Blocker, deadline: Option<Instant>) -> Self {
        Self {
            blocker,
            deadline,
            waiter: None,
            timer: None,
        }
    }

    pub(crate) fn waiter(&self) -> Option<&Arc<Waiter>> {
        self.waiter.as_ref()
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Checks done before queueing: cancellation, then an already-passed
    /// deadline. `None` means go ahead and queue.
    pub(crate) fn before_queue(&self) -> Option<Poll<Result<(), RuntimeError>>> {
        match context::poll_cancellation() {
            Poll::Pending => return Some(Poll::Pending),
            Poll::Ready(true) => return Some(Poll::Ready(Err(RuntimeError::Cancelled))),
            Poll::Ready(false) => {}
        }
        if self.expired() {
            return Some(Poll::Ready(Err(RuntimeError::Timeout)));
        }
        None
    }

    /// Record `waiter` as queued and suspend.
    pub(crate) fn park(
        &mut self,
        waiter: Arc<Waiter>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), RuntimeError>> {
        if let Some(deadline) = self.deadline {
            match crate::timer::current_timer() {
                Some(timer) => {
                    let key = timer.register(deadline, cx.waker().clone());
                    self.timer = Some((timer, key));
                }
                None => tracing::debug!(
                    blocker = %self.blocker,
                    "timed wait outside a scheduler; deadline checked on wake only"
                ),
            }
        }
        self.waiter = Some(waiter);
        context::record(Suspension::Parked(self.blocker));
        Poll::Pending
    }

    /// Poll a queued wait. `withdraw` must abandon the waiter under the
    /// primitive's lock and report whether it was still waiting.
    pub(crate) fn poll_queued(
        &mut self,
        cx: &mut Context<'_>,
        withdraw: impl FnOnce(&Arc<Waiter>) -> bool,
    ) -> Poll<Result<(), RuntimeError>> {
        let Some(waiter) = self.waiter.clone() else {
            return Poll::Ready(Err(RuntimeError::invalid_state("wait polled before queueing")));
        };
        if waiter.is_granted() {
            return Poll::Ready(self.finish(Ok(())));
        }
        match context::poll_cancellation() {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(true) => {
                let result = if withdraw(&waiter) { Err(RuntimeError::Cancelled) } else { Ok(()) };
                return Poll::Ready(self.finish(result));
            }
            Poll::Ready(false) => {}
        }
        if self.expired() {
            let result = if withdraw(&waiter) { Err(RuntimeError::Timeout) } else { Ok(()) };
            return Poll::Ready(self.finish(result));
        }
        waiter.refresh(cx.waker());
        context::record(Suspension::Parked(self.blocker));
        Poll::Pending
    }

    fn finish(&mut self, result: Result<(), RuntimeError>) -> Result<(), RuntimeError> {
        self.cancel_timer();
        self.waiter = None;
        result
    }

    fn cancel_timer(&mut self) {
        if let Some((timer, key)) = self.timer.take() {
            timer.cancel(key);
        }
    }

    /// Take the waiter of an unfinished wait, for a future's `Drop`.
    pub(crate) fn take_pending(&mut self) -> Option<Arc<Waiter>> {
        self.cancel_timer();
        self.waiter.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Wake;

    struct Noop;

    impl Wake for Noop {
        fn wake(self: Arc<Self>) {}
    }

    fn waiter() -> Arc<Waiter> {
        let waker = Waker::from(Arc::new(Noop));
        Waiter::new(&Context::from_waker(&waker))
    }

    #[test]
    fn grant_and_abandon_are_exclusive() {
        let w = waiter();
        assert!(w.grant());
        assert!(!w.abandon());
        assert!(w.is_granted());
    }

    #[test]
    fn queue_skips_abandoned() {
        let mut q = WaitQueue::default();
        let (a, b, c) = (waiter(), waiter(), waiter());
        q.push(a.clone());
        q.push(b.clone());
        q.push(c.clone());
        assert!(q.withdraw(&a));
        assert_eq!(q.len(), 2);
        assert!(Arc::ptr_eq(&q.grant_next().unwrap(), &b));
        assert_eq!(q.grant_all().len(), 1);
        assert!(c.is_granted());
        assert!(!q.withdraw(&c));
    }

    #[test]
    fn blocker_display() {
        let blocker = Blocker::new(PrimitiveKind::Lock, PrimitiveId::from_raw(4));
        assert_eq!(blocker.to_string(), "lock#4");
        assert_eq!(Blocker::external().to_string(), "external");
    }
}
