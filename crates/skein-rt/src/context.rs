// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-thread runtime context.
//!
//! A carrier thread knows which scheduler and carrier it is. While a task
//! is being resumed, the thread also knows the current task, and
//! suspension points report why they are about to return `Pending`
//! through a one-slot mailbox that the continuation drains after the poll.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;

use crate::error::RuntimeError;
use crate::sched::carrier::CarrierId;
use crate::sched::task::{Task, TaskId, TaskKey};
use crate::sync::Blocker;

/// What a suspension point recorded before returning `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Suspension {
    Yielded,
    Parked(Blocker),
    Cancelled,
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
    /// (scheduler uid, carrier) for carrier threads.
    static CARRIER: Cell<Option<(usize, CarrierId)>> = const { Cell::new(None) };
    static SUSPENSION: Cell<Option<Suspension>> = const { Cell::new(None) };
}

// ---- runtime-internal hooks ----

pub(crate) fn enter_carrier(scheduler: usize, carrier: CarrierId) {
    CARRIER.with(|c| c.set(Some((scheduler, carrier))));
}

pub(crate) fn exit_carrier() {
    CARRIER.with(|c| c.set(None));
}

/// Carrier of `scheduler` that the calling thread is, if any.
pub(crate) fn carrier_of(scheduler: usize) -> Option<CarrierId> {
    match CARRIER.with(Cell::get) {
        Some((uid, carrier)) if uid == scheduler => Some(carrier),
        _ => None,
    }
}

/// Run `f` with `task` installed as the current task.
pub(crate) fn enter_task<R>(task: &Arc<Task>, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<Arc<Task>>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let prev = self.0.take();
            CURRENT_TASK.with(|c| *c.borrow_mut() = prev);
        }
    }

    let prev = CURRENT_TASK.with(|c| c.borrow_mut().replace(Arc::clone(task)));
    let _restore = Restore(prev);
    f()
}

pub(crate) fn with_current<R>(f: impl FnOnce(&Arc<Task>) -> R) -> Option<R> {
    CURRENT_TASK.with(|c| c.borrow().as_ref().map(f))
}

/// Run `f` and return whatever suspension it recorded.
pub(crate) fn capture_suspension<R>(f: impl FnOnce() -> R) -> (R, Option<Suspension>) {
    let outer = SUSPENSION.with(|s| s.take());
    let result = f();
    let recorded = SUSPENSION.with(|s| s.replace(outer));
    (result, recorded)
}

pub(crate) fn record(suspension: Suspension) {
    SUSPENSION.with(|s| s.set(Some(suspension)));
}

/// Cancellation check for suspension points.
///
/// `Ready(false)`: carry on. `Pending`: the request was just surfaced to
/// the scheduler, return `Pending` now. `Ready(true)`: fail with
/// `Cancelled`.
pub(crate) fn poll_cancellation() -> Poll<bool> {
    with_current(|task| {
        let token = task.cancel_token();
        if !token.is_cancelled() {
            Poll::Ready(false)
        } else if token.surface() {
            record(Suspension::Cancelled);
            Poll::Pending
        } else {
            Poll::Ready(true)
        }
    })
    .unwrap_or(Poll::Ready(false))
}

pub(crate) fn current_key() -> Option<TaskKey> {
    with_current(|t| t.key())
}

// ---- public queries ----

/// Id of the task running on this thread.
pub fn current_task() -> Option<TaskId> {
    with_current(|t| t.id())
}

pub fn current_task_name() -> Option<String> {
    with_current(|t| t.name().map(str::to_owned)).flatten()
}

/// Carrier this thread is, for any scheduler.
pub fn current_carrier() -> Option<CarrierId> {
    CARRIER.with(Cell::get).map(|(_, carrier)| carrier)
}

/// Whether cancellation was requested for the current task.
pub fn is_cancelled() -> bool {
    with_current(|t| t.cancel_token().is_cancelled()).unwrap_or(false)
}

/// One-line description of who is running here, for log lines.
///
/// `task#3[worker-1]/mounted@carrier-0` inside a task,
/// `thread[main]` elsewhere.
pub fn describe_current() -> String {
    let task = with_current(|t| (t.id(), t.name().map(str::to_owned), t.state()));
    match task {
        Some((id, name, state)) => {
            let carrier = current_carrier()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unmounted".to_string());
            match name {
                Some(name) => format!("{id}[{name}]/{state}@{carrier}"),
                None => format!("{id}/{state}@{carrier}"),
            }
        }
        None => format!("thread[{}]", thread::current().name().unwrap_or("unnamed")),
    }
}

// ---- yield ----

/// Give the carrier to the next runnable task.
///
/// The task goes to the back of its run queue. A pinned task stays on
/// its carrier and resumes right away.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = Result<(), RuntimeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            return Poll::Ready(Ok(()));
        }
        match poll_cancellation() {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(true) => return Poll::Ready(Err(RuntimeError::Cancelled)),
            Poll::Ready(false) => {}
        }
        self.yielded = true;
        record(Suspension::Yielded);
        if current_task().is_none() {
            // Foreign executor: ask to be polled again.
            cx.waker().wake_by_ref();
        }
        Poll::Pending
    }
}

// ---- native sections ----

/// Mark the current task as inside a native section until dropped.
///
/// While at least one section is open, the task can't leave its carrier:
/// a suspension point pins the carrier instead of freeing it. The guard
/// is `Send`, so it may be closed from another thread; a pinned task then
/// unmounts at the carrier's next re-check. Outside a task this is a
/// no-op.
pub fn enter_native() -> NativeSection {
    let task = with_current(Arc::clone);
    if let Some(task) = &task {
        task.enter_native();
    }
    NativeSection { task }
}

#[must_use = "the native section ends when the guard is dropped"]
pub struct NativeSection {
    task: Option<Arc<Task>>,
}

impl NativeSection {
    /// Whether this guard is counted against a task.
    pub fn is_pinning(&self) -> bool {
        self.task.is_some()
    }

    pub fn task(&self) -> Option<TaskId> {
        self.task.as_ref().map(|t| t.id())
    }
}

impl std::fmt::Debug for NativeSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeSection")
            .field("task", &self.task())
            .finish()
    }
}

impl Drop for NativeSection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.exit_native();
        }
    }
}
