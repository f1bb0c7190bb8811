// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime and task errors.
//!
//! `RuntimeError` is what scheduler calls and suspension points return.
//! `TaskError` is what a task body ends with; it is captured on the task
//! and only resurfaces through `await_all`/`await_any`/`join`.

use std::fmt;

use thiserror::Error;

use crate::sched::task::TaskId;

/// Errors returned by the scheduler API and by suspension points.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// Operation not valid in the current state: resuming a continuation
    /// that is running or finished, unlocking a lock you don't hold.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// One or more awaited tasks failed.
    #[error(transparent)]
    Aggregate(#[from] AggregateFailure),

    /// A wait passed its deadline. Only the wait failed, not the task.
    #[error("wait timed out")]
    Timeout,

    /// Cancellation was requested for the calling task.
    #[error("task was cancelled")]
    Cancelled,

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// A task-only primitive was used from a plain OS thread.
    #[error("`{0}` can only be called from inside a task")]
    NotInTask(&'static str),

    #[error("scheduler is shut down")]
    ShutDown,

    /// A carrier or timer thread could not be started.
    #[error("failed to start runtime thread: {0}")]
    Spawn(String),
}

impl RuntimeError {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        RuntimeError::InvalidState(msg.into())
    }
}

/// Why a task terminated without completing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task body panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task body returned an error.
    #[error("task failed: {0}")]
    Failed(String),

    /// The task observed a cancellation request and gave up.
    #[error("task was cancelled")]
    Cancelled,

    /// A runtime call inside the task failed and the body propagated it.
    #[error(transparent)]
    Runtime(RuntimeError),
}

impl TaskError {
    /// Build a `Failed` error from anything displayable.
    pub fn msg(msg: impl fmt::Display) -> Self {
        TaskError::Failed(msg.to_string())
    }
}

impl From<RuntimeError> for TaskError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Cancelled => TaskError::Cancelled,
            other => TaskError::Runtime(other),
        }
    }
}

/// The failure of one awaited task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: TaskId,
    pub error: TaskError,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.task, self.error)
    }
}

/// Every failure among a set of awaited tasks, in the order they were named.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct AggregateFailure {
    failures: Vec<TaskFailure>,
}

impl AggregateFailure {
    pub(crate) fn new(failures: Vec<TaskFailure>) -> Self {
        debug_assert!(!failures.is_empty());
        Self { failures }
    }

    pub(crate) fn single(task: TaskId, error: TaskError) -> Self {
        Self::new(vec![TaskFailure { task, error }])
    }

    pub fn failures(&self) -> &[TaskFailure] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failed task ids, in order.
    pub fn tasks(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.failures.iter().map(|f| f.task)
    }
}

impl fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.len() == 1 {
            write!(f, "1 task failed: {}", self.failures[0])
        } else {
            write!(f, "{} tasks failed", self.failures.len())?;
            for failure in &self.failures {
                write!(f, "; {}", failure)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_maps_to_task_cancelled() {
        let err: TaskError = RuntimeError::Cancelled.into();
        assert_eq!(err, TaskError::Cancelled);
    }

    #[test]
    fn other_runtime_errors_are_wrapped() {
        let err: TaskError = RuntimeError::Timeout.into();
        assert_eq!(err, TaskError::Runtime(RuntimeError::Timeout));
        assert_eq!(err.to_string(), "wait timed out");
    }

    #[test]
    fn aggregate_keeps_every_failure() {
        let agg = AggregateFailure::new(vec![
            TaskFailure { task: TaskId::from_raw(1), error: TaskError::msg("a") },
            TaskFailure { task: TaskId::from_raw(3), error: TaskError::Cancelled },
        ]);
        assert_eq!(agg.len(), 2);
        assert_eq!(agg.tasks().collect::<Vec<_>>(), vec![TaskId::from_raw(1), TaskId::from_raw(3)]);
        let text = agg.to_string();
        assert!(text.starts_with("2 tasks failed"));
        assert!(text.contains("task#1: task failed: a"));
    }
}
