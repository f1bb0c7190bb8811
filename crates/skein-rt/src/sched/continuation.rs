// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Resumable units of work.
//!
//! A continuation wraps a boxed task future. Each `resume` polls it once
//! and reports why it stopped: a suspension point records its reason in
//! the thread-local context right before returning `Pending`, and the
//! continuation reads it back once the poll returns. Panics are caught and
//! become `Failed`.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use crate::context::{self, Suspension};
use crate::error::{RuntimeError, TaskError};
use crate::sync::Blocker;
use crate::util::panic_message;

/// What a task body finishes with.
pub type TaskResult = Result<(), TaskError>;

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = TaskResult> + Send>>;

/// Why control came back from a resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuspendReason {
    /// The body called `yield_now`.
    Yielded,
    /// The body is waiting on a blocker and will be woken through its waker.
    ParkedOn(Blocker),
    /// A suspension point surfaced a cancellation request. The task should
    /// be resumed promptly so the point can return `Cancelled`.
    Cancelled,
    Completed,
    Failed(TaskError),
}

impl SuspendReason {
    /// `Completed` and `Failed` end the continuation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SuspendReason::Completed | SuspendReason::Failed(_))
    }
}

impl fmt::Display for SuspendReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuspendReason::Yielded => write!(f, "yielded"),
            SuspendReason::ParkedOn(b) => write!(f, "parked on {b}"),
            SuspendReason::Cancelled => write!(f, "cancelled"),
            SuspendReason::Completed => write!(f, "completed"),
            SuspendReason::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

pub struct Continuation {
    future: Option<BoxFuture>,
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("done", &self.is_done())
            .finish()
    }
}

impl Continuation {
    pub fn new<F>(body: F) -> Self
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            future: Some(Box::pin(body)),
        }
    }

    /// True once the body completed, failed or panicked.
    pub fn is_done(&self) -> bool {
        self.future.is_none()
    }

    /// Run the body until its next suspension point or until it ends.
    ///
    /// Fails with `InvalidState` if the continuation already terminated.
    pub fn resume(&mut self, waker: &Waker) -> Result<SuspendReason, RuntimeError> {
        let future = self
            .future
            .as_mut()
            .ok_or_else(|| RuntimeError::invalid_state("continuation has already terminated"))?;

        let mut cx = Context::from_waker(waker);
        let (polled, recorded) = context::capture_suspension(|| {
            panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
        });

        let reason = match polled {
            Ok(Poll::Pending) => match recorded {
                Some(Suspension::Yielded) => SuspendReason::Yielded,
                Some(Suspension::Parked(blocker)) => SuspendReason::ParkedOn(blocker),
                Some(Suspension::Cancelled) => SuspendReason::Cancelled,
                None => SuspendReason::ParkedOn(Blocker::external()),
            },
            Ok(Poll::Ready(Ok(()))) => SuspendReason::Completed,
            Ok(Poll::Ready(Err(e))) => SuspendReason::Failed(e),
            Err(payload) => SuspendReason::Failed(TaskError::Panicked(panic_message(payload))),
        };
        if reason.is_terminal() {
            self.future = None;
        }
        Ok(reason)
    }
}
