// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Pin detection and reporting.
//!
//! A task suspending inside a native section can't leave its carrier. The
//! monitor decides that (`can_unmount`), emits one event per pinned
//! suspension to the configured sink, and keeps a bounded history with
//! how long each pin lasted.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::PinSink;
use crate::sched::carrier::CarrierId;
use crate::sched::task::{Task, TaskId};
use crate::sync::Blocker;
use crate::util::lock;

/// A task blocked while pinned to its carrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinEvent {
    pub task: TaskId,
    pub task_name: Option<String>,
    pub carrier: CarrierId,
    pub blocker: Blocker,
    pub blocked_since: Instant,
}

impl fmt::Display for PinEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.task)?;
        if let Some(name) = &self.task_name {
            write!(f, "[{name}]")?;
        }
        write!(f, " pinned {} while blocked on {}", self.carrier, self.blocker)
    }
}

/// A pin event and, once the pin ended, how long the carrier was held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinRecord {
    pub event: PinEvent,
    pub blocked_for: Option<Duration>,
}

/// Receives pin diagnostics. Called on the pinned carrier's thread.
pub trait PinObserver: Send + Sync {
    fn pinned(&self, event: &PinEvent);

    /// The pin ended after `blocked_for`.
    fn released(&self, event: &PinEvent, blocked_for: Duration) {
        let _ = (event, blocked_for);
    }
}

/// Handle for an open pin, returned by `report` and closed by `release`.
#[derive(Debug)]
pub(crate) struct PinTicket {
    seq: u64,
    event: PinEvent,
}

pub struct PinningMonitor {
    sink: PinSink,
    capacity: usize,
    history: Mutex<VecDeque<(u64, PinRecord)>>,
    next_seq: AtomicU64,
}

impl fmt::Debug for PinningMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinningMonitor")
            .field("sink", &self.sink)
            .field("total", &self.total())
            .finish()
    }
}

impl PinningMonitor {
    pub(crate) fn new(sink: PinSink, capacity: usize) -> Self {
        Self {
            sink,
            capacity,
            history: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// A task may leave its carrier only outside native sections.
    pub(crate) fn can_unmount(&self, task: &Task) -> bool {
        task.native_depth() == 0
    }

    pub(crate) fn report(&self, task: &Task, carrier: CarrierId, blocker: Blocker) -> PinTicket {
        let event = PinEvent {
            task: task.id(),
            task_name: task.name().map(str::to_owned),
            carrier,
            blocker,
            blocked_since: Instant::now(),
        };
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        if self.capacity > 0 {
            let mut history = lock(&self.history);
            if history.len() >= self.capacity {
                history.pop_front();
            }
            history.push_back((
                seq,
                PinRecord {
                    event: event.clone(),
                    blocked_for: None,
                },
            ));
        }
        match &self.sink {
            PinSink::Log => tracing::warn!(
                task = %event.task,
                carrier = %event.carrier,
                blocker = %event.blocker,
                "carrier pinned: task blocked inside a native section"
            ),
            PinSink::Silent => {}
            PinSink::Observer(observer) => observer.pinned(&event),
        }
        PinTicket { seq, event }
    }

    pub(crate) fn release(&self, ticket: PinTicket) {
        let blocked_for = ticket.event.blocked_since.elapsed();
        {
            let mut history = lock(&self.history);
            let open = history.iter_mut().rev().find(|(seq, _)| *seq == ticket.seq);
            if let Some((_, record)) = open {
                record.blocked_for = Some(blocked_for);
            }
        }
        match &self.sink {
            PinSink::Log => tracing::debug!(
                task = %ticket.event.task,
                carrier = %ticket.event.carrier,
                blocked_ms = blocked_for.as_millis() as u64,
                "carrier released"
            ),
            PinSink::Silent => {}
            PinSink::Observer(observer) => observer.released(&ticket.event, blocked_for),
        }
    }

    /// Retained records, oldest first.
    pub fn records(&self) -> Vec<PinRecord> {
        lock(&self.history).iter().map(|(_, r)| r.clone()).collect()
    }

    /// Pin events since start, including ones evicted from the history.
    pub fn total(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::continuation::Continuation;
    use crate::sync::{PrimitiveId, PrimitiveKind};
    use std::sync::{Arc, Weak};

    #[derive(Default)]
    struct Collect(Mutex<Vec<(TaskId, Option<Duration>)>>);

    impl PinObserver for Collect {
        fn pinned(&self, event: &PinEvent) {
            lock(&self.0).push((event.task, None));
        }

        fn released(&self, event: &PinEvent, blocked_for: Duration) {
            lock(&self.0).push((event.task, Some(blocked_for)));
        }
    }

    fn task(id: u64) -> Task {
        Task::new(
            TaskId::from_raw(id),
            Some(format!("t{id}")),
            Continuation::new(async { Ok(()) }),
            Weak::new(),
        )
    }

    fn blocker() -> Blocker {
        Blocker::new(PrimitiveKind::Timer, PrimitiveId::from_raw(1))
    }

    #[test]
    fn depth_decides_unmount() {
        let monitor = PinningMonitor::new(PinSink::Silent, 8);
        let t = task(1);
        assert!(monitor.can_unmount(&t));
        t.enter_native();
        assert!(!monitor.can_unmount(&t));
        t.exit_native();
        assert!(monitor.can_unmount(&t));
    }

    #[test]
    fn observer_sees_pin_and_release() {
        let observer = Arc::new(Collect::default());
        let monitor = PinningMonitor::new(PinSink::Observer(observer.clone()), 8);
        let t = task(4);
        let ticket = monitor.report(&t, CarrierId::new(0), blocker());
        std::thread::sleep(Duration::from_millis(5));
        monitor.release(ticket);

        let seen = lock(&observer.0).clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (TaskId::from_raw(4), None));
        assert!(seen[1].1.unwrap() >= Duration::from_millis(5));
        let records = monitor.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.task_name.as_deref(), Some("t4"));
        assert!(records[0].blocked_for.is_some());
    }

    #[test]
    fn history_is_bounded() {
        let monitor = PinningMonitor::new(PinSink::Silent, 2);
        let t = task(1);
        for _ in 0..3 {
            let ticket = monitor.report(&t, CarrierId::new(0), blocker());
            monitor.release(ticket);
        }
        assert_eq!(monitor.records().len(), 2);
        assert_eq!(monitor.total(), 3);
    }
}
