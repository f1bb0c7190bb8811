// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cloneable access to a running scheduler.
//!
//! `Handle` is what tasks and other threads use to submit work, cancel
//! tasks, wait on them and look inside the scheduler. `Scheduler`
//! dereferences to one.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use super::carrier::CarrierInfo;
use super::continuation::{Continuation, TaskResult};
use super::pinning::PinRecord;
use super::scheduler::{SchedulerStats, Shared, STOP_POLL};
use super::task::{Task, TaskId, TaskInfo, TaskState};
use crate::config::SchedulerConfig;
use crate::context::{self, Suspension};
use crate::error::{AggregateFailure, RuntimeError, TaskFailure};
use crate::sync::{Blocker, PrimitiveId, PrimitiveKind};

#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("carriers", &self.shared.pool.len())
            .field("discipline", &self.shared.config.discipline)
            .field("live", &self.shared.live())
            .finish()
    }
}

impl Handle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Handle of the scheduler running the current task.
    pub fn current() -> Option<Handle> {
        context::with_current(|t| t.shared())
            .flatten()
            .map(Handle::new)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Submit an unnamed task. It becomes RUNNABLE at the tail of the
    /// global run queue.
    ///
    /// The task's record (name, state, outcome) stays in the scheduler
    /// after it terminates so `task_state`, `join` and `await_all` can
    /// still see it. Long-running schedulers should call [`Handle::reap`]
    /// once outcomes have been collected.
    pub fn submit<F>(&self, body: F) -> Result<TaskId, RuntimeError>
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        self.shared.spawn(None, Continuation::new(body))
    }

    pub fn builder(&self) -> TaskBuilder<'_> {
        TaskBuilder {
            handle: self,
            name: None,
        }
    }

    /// A factory naming its tasks `{prefix}{n}`, counting from `start`.
    pub fn factory(&self, prefix: impl Into<String>, start: u64) -> TaskFactory {
        let prefix: String = prefix.into();
        TaskFactory {
            handle: self.clone(),
            prefix: Arc::from(prefix),
            counter: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Wait for `id` from inside a task. Resolves once it terminates;
    /// a failed target yields an `Aggregate` with its single failure.
    pub fn join(&self, id: TaskId) -> JoinFuture {
        JoinFuture {
            target: self.shared.lookup(id),
            registered: false,
        }
    }

    /// Request cancellation. Delivered at the task's next suspension
    /// point; a terminated task is left alone.
    pub fn cancel(&self, id: TaskId) -> Result<(), RuntimeError> {
        let task = self.shared.lookup(id)?;
        if task.is_terminated() {
            return Ok(());
        }
        task.cancel_token().cancel();
        tracing::debug!(task = %id, "cancellation requested");
        task.signal();
        Ok(())
    }

    /// Block the calling thread until every task in `ids` terminated.
    ///
    /// Fails with `Aggregate` listing every failure, in the order given.
    /// Must not be called from one of this scheduler's carriers; inside a
    /// task use [`Handle::join`].
    pub fn await_all(&self, ids: &[TaskId]) -> Result<(), RuntimeError> {
        self.await_all_inner(ids, None)
    }

    /// Like `await_all`, giving up with `Timeout` after `timeout`. The
    /// tasks themselves keep running.
    pub fn await_all_timeout(&self, ids: &[TaskId], timeout: Duration) -> Result<(), RuntimeError> {
        self.await_all_inner(ids, Some(Instant::now() + timeout))
    }

    fn await_all_inner(
        &self,
        ids: &[TaskId],
        deadline: Option<Instant>,
    ) -> Result<(), RuntimeError> {
        self.check_blocking("await_all")?;
        let tasks = self.resolve(ids)?;
        self.shared.wait_completions(
            || tasks.iter().all(|t| t.is_terminated()).then_some(()),
            || next_wait(deadline),
        )?;
        let failures: Vec<TaskFailure> = tasks
            .iter()
            .filter_map(|t| {
                t.failure().map(|error| TaskFailure {
                    task: t.id(),
                    error,
                })
            })
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AggregateFailure::new(failures).into())
        }
    }

    /// Block until one task in `ids` completed successfully and return
    /// its id. If every task failed, the error lists all failures.
    pub fn await_any(&self, ids: &[TaskId]) -> Result<TaskId, RuntimeError> {
        if ids.is_empty() {
            return Err(RuntimeError::invalid_state("await_any needs at least one task"));
        }
        self.check_blocking("await_any")?;
        let tasks = self.resolve(ids)?;
        let winner = self.shared.wait_completions(
            || {
                if let Some(t) = tasks
                    .iter()
                    .find(|t| t.is_terminated() && matches!(t.outcome(), Some(Ok(()))))
                {
                    return Some(Some(t.id()));
                }
                tasks.iter().all(|t| t.is_terminated()).then_some(None)
            },
            || Ok(STOP_POLL),
        )?;
        match winner {
            Some(id) => Ok(id),
            None => {
                let failures = tasks
                    .iter()
                    .filter_map(|t| {
                        t.failure().map(|error| TaskFailure {
                            task: t.id(),
                            error,
                        })
                    })
                    .collect();
                Err(AggregateFailure::new(failures).into())
            }
        }
    }

    fn resolve(&self, ids: &[TaskId]) -> Result<Vec<Arc<Task>>, RuntimeError> {
        ids.iter().map(|id| self.shared.lookup(*id)).collect()
    }

    fn check_blocking(&self, what: &str) -> Result<(), RuntimeError> {
        if context::carrier_of(self.shared.uid()).is_some() {
            return Err(RuntimeError::invalid_state(format!(
                "{what} would block a carrier; use join inside tasks"
            )));
        }
        Ok(())
    }

    // ---- introspection ----

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.shared.lookup(id).ok().map(|t| t.state())
    }

    pub fn task_info(&self, id: TaskId) -> Option<TaskInfo> {
        self.shared.lookup(id).ok().map(|t| t.info())
    }

    /// Every task still in the arena, in submission order.
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.shared.all_tasks().iter().map(|t| t.info()).collect()
    }

    pub fn carriers(&self) -> Vec<CarrierInfo> {
        self.shared.pool.snapshot()
    }

    pub fn pin_records(&self) -> Vec<PinRecord> {
        self.shared.monitor.records()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats()
    }

    pub fn live_tasks(&self) -> usize {
        self.shared.live()
    }

    /// Forget terminated tasks and return how many were dropped. Their ids
    /// become unknown; live tasks are kept. Nothing is reaped
    /// automatically.
    pub fn reap(&self) -> usize {
        self.shared.reap()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_stopping()
    }
}

fn next_wait(deadline: Option<Instant>) -> Result<Duration, RuntimeError> {
    match deadline {
        None => Ok(STOP_POLL),
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                Err(RuntimeError::Timeout)
            } else {
                Ok(left.min(STOP_POLL))
            }
        }
    }
}

/// Configure a task before submitting it.
#[derive(Debug)]
#[must_use]
pub struct TaskBuilder<'a> {
    handle: &'a Handle,
    name: Option<String>,
}

impl TaskBuilder<'_> {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn submit<F>(self, body: F) -> Result<TaskId, RuntimeError>
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        self.handle.shared.spawn(self.name, Continuation::new(body))
    }
}

/// Submits tasks with generated names. Clones share the counter.
#[derive(Clone)]
pub struct TaskFactory {
    handle: Handle,
    prefix: Arc<str>,
    counter: Arc<AtomicU64>,
}

impl fmt::Debug for TaskFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFactory")
            .field("prefix", &self.prefix)
            .field("next", &self.counter.load(Ordering::Relaxed))
            .finish()
    }
}

impl TaskFactory {
    pub fn submit<F>(&self, body: F) -> Result<TaskId, RuntimeError>
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}{}", self.prefix, n);
        self.handle.shared.spawn(Some(name), Continuation::new(body))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

/// Resolves when the target task terminates.
#[must_use = "futures do nothing unless awaited"]
pub struct JoinFuture {
    target: Result<Arc<Task>, RuntimeError>,
    registered: bool,
}

impl fmt::Debug for JoinFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinFuture")
            .field("target", &self.target.as_ref().map(|t| t.id()))
            .finish()
    }
}

fn join_outcome(task: &Task) -> Result<(), RuntimeError> {
    match task.outcome() {
        Some(Ok(())) => Ok(()),
        Some(Err(error)) => Err(AggregateFailure::single(task.id(), error).into()),
        None => Err(RuntimeError::ShutDown),
    }
}

impl Future for JoinFuture {
    type Output = Result<(), RuntimeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task = match &self.target {
            Ok(task) => Arc::clone(task),
            Err(e) => return Poll::Ready(Err(e.clone())),
        };
        if task.is_terminated() {
            return Poll::Ready(join_outcome(&task));
        }
        if context::current_key() == Some(task.key()) {
            return Poll::Ready(Err(RuntimeError::invalid_state(format!(
                "{} can't join itself",
                task.id()
            ))));
        }
        if task.shared().map_or(true, |s| s.is_stopping()) {
            return Poll::Ready(Err(RuntimeError::ShutDown));
        }
        match context::poll_cancellation() {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(true) => return Poll::Ready(Err(RuntimeError::Cancelled)),
            Poll::Ready(false) => {}
        }
        if !self.registered {
            if !task.register_join(cx.waker().clone()) {
                return Poll::Ready(join_outcome(&task));
            }
            self.registered = true;
        }
        let blocker = Blocker::new(PrimitiveKind::Join, PrimitiveId::from_raw(task.id().as_u64()));
        context::record(Suspension::Parked(blocker));
        Poll::Pending
    }
}
