// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Thread-blocking reentrant monitor.
//!
//! Models a `synchronized` block: owned by a task (or a plain thread), and
//! a contended `enter` blocks the OS thread rather than parking the task.
//! Holding the monitor opens a native section, so any suspension inside
//! it pins the carrier.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use crate::context::{self, NativeSection};
use crate::sched::task::TaskKey;
use crate::util::{lock, wait};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Task(TaskKey),
    Thread(ThreadId),
}

impl Owner {
    fn current() -> Self {
        match context::current_key() {
            Some(key) => Owner::Task(key),
            None => Owner::Thread(thread::current().id()),
        }
    }
}

#[derive(Default)]
struct MonitorState {
    owner: Option<Owner>,
    depth: usize,
}

#[derive(Default)]
pub struct NativeMonitor {
    state: Mutex<MonitorState>,
    free: Condvar,
    contended: AtomicU64,
}

impl fmt::Debug for NativeMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("NativeMonitor")
            .field("owner", &state.owner)
            .field("depth", &state.depth)
            .finish()
    }
}

impl NativeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter, blocking the calling thread while someone else owns it.
    pub fn enter(&self) -> MonitorGuard<'_> {
        let me = Owner::current();
        let mut state = lock(&self.state);
        let mut counted = false;
        while matches!(state.owner, Some(owner) if owner != me) {
            if !counted {
                self.contended.fetch_add(1, Ordering::Relaxed);
                counted = true;
            }
            state = wait(&self.free, state);
        }
        state.owner = Some(me);
        state.depth += 1;
        drop(state);
        MonitorGuard {
            monitor: self,
            _section: context::enter_native(),
        }
    }

    /// Enter only if free or already owned by the caller.
    pub fn try_enter(&self) -> Option<MonitorGuard<'_>> {
        let me = Owner::current();
        let mut state = lock(&self.state);
        if matches!(state.owner, Some(owner) if owner != me) {
            return None;
        }
        state.owner = Some(me);
        state.depth += 1;
        drop(state);
        Some(MonitorGuard {
            monitor: self,
            _section: context::enter_native(),
        })
    }

    pub fn is_held(&self) -> bool {
        lock(&self.state).owner.is_some()
    }

    /// How many `enter` calls had to block.
    pub fn contended(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }

    fn exit(&self) {
        let mut state = lock(&self.state);
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.free.notify_one();
        }
    }
}

/// Held monitor. Exits on drop.
#[must_use = "the monitor is released when the guard is dropped"]
pub struct MonitorGuard<'a> {
    monitor: &'a NativeMonitor,
    _section: NativeSection,
}

impl fmt::Debug for MonitorGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorGuard").finish_non_exhaustive()
    }
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        self.monitor.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn reentrant_on_one_thread() {
        let m = NativeMonitor::new();
        let outer = m.enter();
        let inner = m.try_enter();
        assert!(inner.is_some());
        drop(inner);
        assert!(m.is_held());
        drop(outer);
        assert!(!m.is_held());
    }

    #[test]
    fn second_thread_blocks_until_exit() {
        let m = Arc::new(NativeMonitor::new());
        let guard = m.enter();
        let other = {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                assert!(m.try_enter().is_none());
                let _g = m.enter();
            })
        };
        let give_up = std::time::Instant::now() + Duration::from_secs(5);
        while m.contended() == 0 && std::time::Instant::now() < give_up {
            thread::sleep(Duration::from_millis(1));
        }
        drop(guard);
        other.join().unwrap();
        assert_eq!(m.contended(), 1);
    }
}
