// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! One-shot countdown latch.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use super::{wake_all, Blocker, Parking, PrimitiveId, PrimitiveKind, WaitQueue, Waiter};
use crate::error::RuntimeError;
use crate::util::{lock, wait, wait_timeout};

struct LatchState {
    count: usize,
    waiters: WaitQueue,
}

/// Releases every waiter when the count reaches zero. Tasks wait with
/// [`CountDownLatch::wait`]; plain threads use `wait_blocking`.
pub struct CountDownLatch {
    id: PrimitiveId,
    state: Mutex<LatchState>,
    zero: Condvar,
}

impl fmt::Debug for CountDownLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("CountDownLatch")
            .field("id", &self.id)
            .field("count", &state.count)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            id: PrimitiveId::next(),
            state: Mutex::new(LatchState {
                count,
                waiters: WaitQueue::default(),
            }),
            zero: Condvar::new(),
        }
    }

    pub fn blocker(&self) -> Blocker {
        Blocker::new(PrimitiveKind::Latch, self.id)
    }

    /// Decrement the count. Reaching zero releases every waiter at once;
    /// returns how many were released. A no-op at zero.
    pub fn count_down(&self) -> usize {
        let released = {
            let mut state = lock(&self.state);
            if state.count == 0 {
                return 0;
            }
            state.count -= 1;
            if state.count > 0 {
                return 0;
            }
            self.zero.notify_all();
            state.waiters.grant_all()
        };
        let n = released.len();
        tracing::debug!(latch = %self.blocker(), released = n, "latch opened");
        wake_all(released);
        n
    }

    pub fn count(&self) -> usize {
        lock(&self.state).count
    }

    /// Tasks currently parked on the latch.
    pub fn waiting(&self) -> usize {
        lock(&self.state).waiters.len()
    }

    /// Park until the count is zero. Returns at once if it already is.
    pub fn wait(&self) -> LatchWait<'_> {
        self.wait_inner(None)
    }

    pub fn wait_until(&self, deadline: Instant) -> LatchWait<'_> {
        self.wait_inner(Some(deadline))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> LatchWait<'_> {
        self.wait_inner(Some(Instant::now() + timeout))
    }

    fn wait_inner(&self, deadline: Option<Instant>) -> LatchWait<'_> {
        LatchWait {
            latch: self,
            parking: Parking::new(self.blocker(), deadline),
            done: false,
        }
    }

    /// Block the calling OS thread until the count is zero.
    pub fn wait_blocking(&self) {
        let mut state = lock(&self.state);
        while state.count > 0 {
            state = wait(&self.zero, state);
        }
    }

    /// Like `wait_blocking`, failing with `Timeout` after `timeout`.
    pub fn wait_blocking_timeout(&self, timeout: Duration) -> Result<(), RuntimeError> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        while state.count > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(RuntimeError::Timeout);
            }
            state = wait_timeout(&self.zero, state, left);
        }
        Ok(())
    }

    fn withdraw(&self, waiter: &Arc<Waiter>) -> bool {
        lock(&self.state).waiters.withdraw(waiter)
    }
}

/// Future returned by [`CountDownLatch::wait`] and its timed variants.
#[must_use = "futures do nothing unless awaited"]
pub struct LatchWait<'a> {
    latch: &'a CountDownLatch,
    parking: Parking,
    done: bool,
}

impl Future for LatchWait<'_> {
    type Output = Result<(), RuntimeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(Ok(()));
        }
        let latch = this.latch;
        if this.parking.waiter().is_some() {
            let result = ready!(this.parking.poll_queued(cx, |w| latch.withdraw(w)));
            this.done = true;
            return Poll::Ready(result);
        }
        if latch.count() == 0 {
            this.done = true;
            return Poll::Ready(Ok(()));
        }
        if let Some(early) = this.parking.before_queue() {
            this.done = early.is_ready();
            return early;
        }
        let waiter = Waiter::new(cx);
        {
            let mut state = lock(&latch.state);
            if state.count == 0 {
                this.done = true;
                return Poll::Ready(Ok(()));
            }
            state.waiters.push(Arc::clone(&waiter));
        }
        this.parking.park(waiter, cx)
    }
}

impl Drop for LatchWait<'_> {
    fn drop(&mut self) {
        if let Some(waiter) = self.parking.take_pending() {
            self.latch.withdraw(&waiter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn counts_down_to_zero_and_stays() {
        let latch = CountDownLatch::new(3);
        assert_eq!(latch.count_down(), 0);
        assert_eq!(latch.count_down(), 0);
        assert_eq!(latch.count(), 1);
        assert_eq!(latch.count_down(), 0);
        assert_eq!(latch.count(), 0);
        assert_eq!(latch.count_down(), 0);
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn releases_blocked_threads() {
        let latch = Arc::new(CountDownLatch::new(2));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.wait_blocking())
            })
            .collect();
        latch.count_down();
        latch.count_down();
        for w in waiters {
            w.join().unwrap();
        }
    }

    #[test]
    fn blocking_wait_times_out() {
        let latch = CountDownLatch::new(1);
        assert_eq!(
            latch.wait_blocking_timeout(Duration::from_millis(10)),
            Err(RuntimeError::Timeout)
        );
        latch.count_down();
        assert_eq!(latch.wait_blocking_timeout(Duration::from_millis(10)), Ok(()));
    }

    #[test]
    fn zero_latch_resolves_without_suspending() {
        use std::task::Wake;
        struct Noop;
        impl Wake for Noop {
            fn wake(self: Arc<Self>) {}
        }
        let latch = CountDownLatch::new(0);
        let waker = std::task::Waker::from(Arc::new(Noop));
        let mut cx = Context::from_waker(&waker);
        let mut fut = latch.wait();
        assert_eq!(Pin::new(&mut fut).poll(&mut cx), Poll::Ready(Ok(())));
    }
}
