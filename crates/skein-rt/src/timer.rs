// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deadlines and sleeping.
//!
//! Each scheduler runs one timer thread holding a deadline-ordered map of
//! wakers. Sleeps and timed waits register an entry; the thread fires
//! every entry whose deadline passed and then waits for the next one.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::context::{self, Suspension};
use crate::error::RuntimeError;
use crate::sync::{Blocker, PrimitiveId, PrimitiveKind};
use crate::util::{lock, wait, wait_timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    deadline: Instant,
    seq: u64,
}

#[derive(Default)]
struct TimerState {
    entries: BTreeMap<TimerKey, Waker>,
    next_seq: u64,
    shutdown: bool,
}

#[derive(Default)]
pub(crate) struct Timer {
    state: Mutex<TimerState>,
    cvar: Condvar,
}

impl Timer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn register(&self, deadline: Instant, waker: Waker) -> TimerKey {
        let mut state = lock(&self.state);
        let key = TimerKey {
            deadline,
            seq: state.next_seq,
        };
        state.next_seq += 1;
        let earliest = state.entries.keys().next().map_or(true, |first| key < *first);
        state.entries.insert(key, waker);
        if earliest {
            self.cvar.notify_one();
        }
        key
    }

    /// Remove an entry. False if it already fired.
    pub(crate) fn cancel(&self, key: TimerKey) -> bool {
        lock(&self.state).entries.remove(&key).is_some()
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub(crate) fn shutdown(&self) {
        lock(&self.state).shutdown = true;
        self.cvar.notify_all();
    }

    /// Timer thread body. Returns after `shutdown`.
    pub(crate) fn run(&self) {
        let mut state = lock(&self.state);
        loop {
            if state.shutdown {
                let dropped = state.entries.len();
                state.entries.clear();
                if dropped > 0 {
                    tracing::debug!(dropped, "timer stopped with pending entries");
                }
                return;
            }
            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(entry) = state.entries.first_entry() {
                if entry.key().deadline > now {
                    break;
                }
                due.push(entry.remove());
            }
            if !due.is_empty() {
                drop(state);
                tracing::trace!(fired = due.len(), "timer entries fired");
                for waker in due {
                    waker.wake();
                }
                state = lock(&self.state);
                continue;
            }
            state = match state.entries.keys().next() {
                Some(first) => {
                    let timeout = first.deadline.saturating_duration_since(now);
                    wait_timeout(&self.cvar, state, timeout)
                }
                None => wait(&self.cvar, state),
            };
        }
    }
}

/// Timer of the scheduler running the current task.
pub(crate) fn current_timer() -> Option<Arc<Timer>> {
    context::with_current(|task| task.shared())
        .flatten()
        .map(|shared| shared.timer())
}

/// Suspend the current task for `duration`.
///
/// The task unmounts and its carrier is free to run others, unless the
/// task is inside a native section, in which case the carrier is pinned
/// for the whole sleep.
pub fn sleep(duration: Duration) -> Sleep {
    sleep_until(Instant::now() + duration)
}

pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep {
        deadline,
        id: PrimitiveId::next(),
        entry: None,
    }
}

#[must_use = "futures do nothing unless awaited"]
pub struct Sleep {
    deadline: Instant,
    id: PrimitiveId,
    entry: Option<(Arc<Timer>, TimerKey)>,
}

impl Sleep {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    fn disarm(&mut self) {
        if let Some((timer, key)) = self.entry.take() {
            timer.cancel(key);
        }
    }
}

impl std::fmt::Debug for Sleep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sleep")
            .field("deadline", &self.deadline)
            .field("armed", &self.entry.is_some())
            .finish()
    }
}

impl Future for Sleep {
    type Output = Result<(), RuntimeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if Instant::now() >= self.deadline {
            self.disarm();
            return Poll::Ready(Ok(()));
        }
        match context::poll_cancellation() {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(true) => {
                self.disarm();
                return Poll::Ready(Err(RuntimeError::Cancelled));
            }
            Poll::Ready(false) => {}
        }
        if self.entry.is_none() {
            let Some(timer) = current_timer() else {
                return Poll::Ready(Err(RuntimeError::NotInTask("sleep")));
            };
            let key = timer.register(self.deadline, cx.waker().clone());
            self.entry = Some((timer, key));
        }
        context::record(Suspension::Parked(Blocker::new(PrimitiveKind::Timer, self.id)));
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.disarm();
    }
}
