// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Park/unpark-style notification.
//!
//! `notify_one` wakes the oldest waiter, or leaves a single permit for the
//! next `wait` if nobody is waiting. Permits don't accumulate.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use super::{wake_all, wake_one, Blocker, Parking, PrimitiveId, PrimitiveKind, WaitQueue, Waiter};
use crate::error::RuntimeError;
use crate::util::lock;

#[derive(Default)]
struct SignalState {
    permit: bool,
    waiters: WaitQueue,
}

pub struct Signal {
    id: PrimitiveId,
    state: Mutex<SignalState>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Signal")
            .field("id", &self.id)
            .field("permit", &state.permit)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

impl Signal {
    pub fn new() -> Self {
        Self {
            id: PrimitiveId::next(),
            state: Mutex::new(SignalState::default()),
        }
    }

    pub fn blocker(&self) -> Blocker {
        Blocker::new(PrimitiveKind::Signal, self.id)
    }

    /// Wake the oldest waiter. Returns false if nobody was waiting and a
    /// permit was stored instead.
    pub fn notify_one(&self) -> bool {
        let next = {
            let mut state = lock(&self.state);
            let next = state.waiters.grant_next();
            if next.is_none() {
                state.permit = true;
            }
            next
        };
        match next {
            Some(waiter) => {
                wake_one(waiter);
                true
            }
            None => false,
        }
    }

    /// Wake every current waiter. Stores no permit.
    pub fn notify_all(&self) -> usize {
        let released = lock(&self.state).waiters.grant_all();
        let n = released.len();
        wake_all(released);
        n
    }

    pub fn waiting(&self) -> usize {
        lock(&self.state).waiters.len()
    }

    pub fn wait(&self) -> SignalWait<'_> {
        self.wait_inner(None)
    }

    pub fn wait_until(&self, deadline: Instant) -> SignalWait<'_> {
        self.wait_inner(Some(deadline))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> SignalWait<'_> {
        self.wait_inner(Some(Instant::now() + timeout))
    }

    fn wait_inner(&self, deadline: Option<Instant>) -> SignalWait<'_> {
        SignalWait {
            signal: self,
            parking: Parking::new(self.blocker(), deadline),
            done: false,
        }
    }

    fn take_permit(&self) -> bool {
        std::mem::take(&mut lock(&self.state).permit)
    }

    fn withdraw(&self, waiter: &Arc<Waiter>) -> bool {
        lock(&self.state).waiters.withdraw(waiter)
    }
}

/// Future returned by [`Signal::wait`] and its timed variants.
#[must_use = "futures do nothing unless awaited"]
pub struct SignalWait<'a> {
    signal: &'a Signal,
    parking: Parking,
    done: bool,
}

impl Future for SignalWait<'_> {
    type Output = Result<(), RuntimeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(Ok(()));
        }
        let signal = this.signal;
        if this.parking.waiter().is_some() {
            let result = ready!(this.parking.poll_queued(cx, |w| signal.withdraw(w)));
            this.done = true;
            return Poll::Ready(result);
        }
        if signal.take_permit() {
            this.done = true;
            return Poll::Ready(Ok(()));
        }
        if let Some(early) = this.parking.before_queue() {
            this.done = early.is_ready();
            return early;
        }
        let waiter = Waiter::new(cx);
        {
            let mut state = lock(&signal.state);
            if std::mem::take(&mut state.permit) {
                this.done = true;
                return Poll::Ready(Ok(()));
            }
            state.waiters.push(Arc::clone(&waiter));
        }
        this.parking.park(waiter, cx)
    }
}

impl Drop for SignalWait<'_> {
    fn drop(&mut self) {
        if let Some(waiter) = self.parking.take_pending() {
            if !self.signal.withdraw(&waiter) {
                // Granted but never observed: pass the notification on.
                self.signal.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::{Wake, Waker};

    struct Noop;

    impl Wake for Noop {
        fn wake(self: Arc<Self>) {}
    }

    #[test]
    fn permit_is_consumed_once() {
        let signal = Signal::new();
        assert!(!signal.notify_one());
        assert!(!signal.notify_one());
        let waker = Waker::from(Arc::new(Noop));
        let mut cx = Context::from_waker(&waker);
        let mut first = signal.wait();
        assert_eq!(Pin::new(&mut first).poll(&mut cx), Poll::Ready(Ok(())));
        let mut second = signal.wait();
        assert!(Pin::new(&mut second).poll(&mut cx).is_pending());
        assert_eq!(signal.waiting(), 1);
        assert!(signal.notify_one());
        assert_eq!(Pin::new(&mut second).poll(&mut cx), Poll::Ready(Ok(())));
    }

    #[test]
    fn dropped_waiter_leaves_the_queue() {
        let signal = Signal::new();
        let waker = Waker::from(Arc::new(Noop));
        let mut cx = Context::from_waker(&waker);
        let mut fut = signal.wait();
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        drop(fut);
        assert_eq!(signal.waiting(), 0);
        assert_eq!(signal.notify_all(), 0);
    }
}
