// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Carrier threads and the pool that tracks them.
//!
//! A carrier runs at most one task at a time. Its slot owns the mounted
//! task; the task only remembers the carrier index. Every operation that
//! changes both sides (mount, unmount, pin, finish) holds the slot lock
//! while it flips the task state, so nobody observes a carrier and task
//! that disagree.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::RuntimeError;
use crate::sched::continuation::TaskResult;
use crate::sched::task::{Task, TaskId, TaskState};
use crate::util::{lock, wait_timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct CarrierId(usize);

impl CarrierId {
    pub(crate) const fn new(index: usize) -> Self {
        CarrierId(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for CarrierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "carrier-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CarrierStatus {
    Idle,
    Busy,
}

/// Consistent snapshot of one carrier.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CarrierInfo {
    pub id: CarrierId,
    pub status: CarrierStatus,
    pub task: Option<TaskId>,
    /// State of `task`, read under the same lock.
    pub task_state: Option<TaskState>,
    pub mounts: u64,
}

struct Slot {
    task: Option<Arc<Task>>,
    mounts: u64,
}

/// Wakeup token for an idle carrier.
#[derive(Default)]
struct Parker {
    token: Mutex<bool>,
    cvar: Condvar,
}

impl Parker {
    fn park_timeout(&self, timeout: Duration) {
        let mut token = lock(&self.token);
        if !*token {
            token = wait_timeout(&self.cvar, token, timeout);
        }
        *token = false;
    }

    fn unpark(&self) {
        *lock(&self.token) = true;
        self.cvar.notify_one();
    }
}

struct Carrier {
    slot: Mutex<Slot>,
    parker: Parker,
}

pub struct CarrierPool {
    carriers: Vec<Carrier>,
    cursor: AtomicUsize,
}

impl fmt::Debug for CarrierPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CarrierPool")
            .field("carriers", &self.carriers.len())
            .field("busy", &self.busy())
            .finish()
    }
}

impl CarrierPool {
    pub(crate) fn new(size: usize) -> Self {
        let carriers = (0..size)
            .map(|_| Carrier {
                slot: Mutex::new(Slot {
                    task: None,
                    mounts: 0,
                }),
                parker: Parker::default(),
            })
            .collect();
        Self {
            carriers,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.carriers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.carriers.is_empty()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = CarrierId> {
        (0..self.carriers.len()).map(CarrierId::new)
    }

    fn carrier(&self, id: CarrierId) -> Result<&Carrier, RuntimeError> {
        self.carriers
            .get(id.0)
            .ok_or_else(|| RuntimeError::invalid_state(format!("no such carrier {id}")))
    }

    /// Find an idle carrier without blocking, round-robin from the last hit.
    pub fn acquire_idle(&self) -> Option<CarrierId> {
        let n = self.carriers.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..n)
            .map(|i| (start + i) % n)
            .find(|&i| lock(&self.carriers[i].slot).task.is_none())
            .map(CarrierId::new)
    }

    pub fn busy(&self) -> usize {
        self.carriers
            .iter()
            .filter(|c| lock(&c.slot).task.is_some())
            .count()
    }

    pub fn snapshot(&self) -> Vec<CarrierInfo> {
        self.ids()
            .zip(&self.carriers)
            .map(|(id, c)| {
                let slot = lock(&c.slot);
                CarrierInfo {
                    id,
                    status: if slot.task.is_some() {
                        CarrierStatus::Busy
                    } else {
                        CarrierStatus::Idle
                    },
                    task: slot.task.as_ref().map(|t| t.id()),
                    task_state: slot.task.as_ref().map(|t| t.state()),
                    mounts: slot.mounts,
                }
            })
            .collect()
    }

    pub(crate) fn park(&self, id: CarrierId, timeout: Duration) {
        if let Ok(c) = self.carrier(id) {
            c.parker.park_timeout(timeout);
        }
    }

    pub(crate) fn unpark(&self, id: CarrierId) {
        if let Ok(c) = self.carrier(id) {
            c.parker.unpark();
        }
    }

    pub(crate) fn unpark_all(&self) {
        for c in &self.carriers {
            c.parker.unpark();
        }
    }

    /// RUNNABLE -> MOUNTED on an idle carrier.
    pub(crate) fn mount(&self, id: CarrierId, task: &Arc<Task>) -> Result<(), RuntimeError> {
        let mut slot = lock(&self.carrier(id)?.slot);
        if let Some(current) = &slot.task {
            return Err(RuntimeError::invalid_state(format!(
                "{id} is busy with {}",
                current.id()
            )));
        }
        if !task.transition(TaskState::Runnable, TaskState::Mounted) {
            return Err(RuntimeError::invalid_state(format!(
                "{} can't mount from {}",
                task.id(),
                task.state()
            )));
        }
        task.set_carrier(Some(id));
        slot.task = Some(Arc::clone(task));
        slot.mounts += 1;
        Ok(())
    }

    /// MOUNTED or PINNED -> `to` (RUNNABLE or PARKED); the carrier goes idle.
    pub(crate) fn unmount(
        &self,
        id: CarrierId,
        task: &Arc<Task>,
        to: TaskState,
    ) -> Result<(), RuntimeError> {
        let mut slot = self.owned_slot(id, task)?;
        let from = task.state();
        if !matches!(from, TaskState::Mounted | TaskState::Pinned) || !task.transition(from, to) {
            return Err(RuntimeError::invalid_state(format!(
                "{} can't unmount from {from} to {to}",
                task.id()
            )));
        }
        task.set_carrier(None);
        slot.task = None;
        Ok(())
    }

    /// MOUNTED -> PINNED; the carrier stays busy.
    pub(crate) fn pin(&self, id: CarrierId, task: &Arc<Task>) -> Result<(), RuntimeError> {
        let _slot = self.owned_slot(id, task)?;
        if !task.transition(TaskState::Mounted, TaskState::Pinned) {
            return Err(RuntimeError::invalid_state(format!(
                "{} can't pin from {}",
                task.id(),
                task.state()
            )));
        }
        Ok(())
    }

    /// PINNED -> RUNNABLE -> MOUNTED without leaving the carrier.
    pub(crate) fn resume_pinned(
        &self,
        id: CarrierId,
        task: &Arc<Task>,
    ) -> Result<(), RuntimeError> {
        let _slot = self.owned_slot(id, task)?;
        if task.transition(TaskState::Pinned, TaskState::Runnable)
            && task.transition(TaskState::Runnable, TaskState::Mounted)
        {
            Ok(())
        } else {
            Err(RuntimeError::invalid_state(format!(
                "{} can't resume from {}",
                task.id(),
                task.state()
            )))
        }
    }

    /// Store the outcome, MOUNTED -> TERMINATED, carrier idle.
    pub(crate) fn finish(
        &self,
        id: CarrierId,
        task: &Arc<Task>,
        outcome: TaskResult,
    ) -> Result<(), RuntimeError> {
        let mut slot = self.owned_slot(id, task)?;
        task.set_outcome(outcome);
        if !task.transition(TaskState::Mounted, TaskState::Terminated) {
            return Err(RuntimeError::invalid_state(format!(
                "{} can't terminate from {}",
                task.id(),
                task.state()
            )));
        }
        task.set_carrier(None);
        slot.task = None;
        Ok(())
    }

    fn owned_slot(
        &self,
        id: CarrierId,
        task: &Arc<Task>,
    ) -> Result<std::sync::MutexGuard<'_, Slot>, RuntimeError> {
        let slot = lock(&self.carrier(id)?.slot);
        match &slot.task {
            Some(current) if Arc::ptr_eq(current, task) => Ok(slot),
            _ => Err(RuntimeError::invalid_state(format!(
                "{} is not mounted on {id}",
                task.id()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::continuation::Continuation;
    use std::sync::Weak;

    fn runnable(id: u64) -> Arc<Task> {
        let t = Arc::new(Task::new(
            TaskId::from_raw(id),
            None,
            Continuation::new(async { Ok(()) }),
            Weak::new(),
        ));
        assert!(t.transition(TaskState::New, TaskState::Runnable));
        t
    }

    #[test]
    fn mount_occupies_the_carrier() {
        let pool = CarrierPool::new(2);
        let c = pool.acquire_idle().unwrap();
        let t = runnable(1);
        pool.mount(c, &t).unwrap();
        assert_eq!(t.state(), TaskState::Mounted);
        assert_eq!(t.carrier(), Some(c));
        assert_eq!(pool.busy(), 1);
        assert!(pool.mount(c, &runnable(2)).is_err());

        let other = pool.acquire_idle().unwrap();
        assert_ne!(other, c);
    }

    #[test]
    fn pool_exhausted() {
        let pool = CarrierPool::new(1);
        let c = pool.acquire_idle().unwrap();
        pool.mount(c, &runnable(1)).unwrap();
        assert_eq!(pool.acquire_idle(), None);
    }

    #[test]
    fn pin_then_unmount_to_parked() {
        let pool = CarrierPool::new(1);
        let c = CarrierId::new(0);
        let t = runnable(1);
        pool.mount(c, &t).unwrap();
        pool.pin(c, &t).unwrap();
        let snap = pool.snapshot();
        assert_eq!(snap[0].status, CarrierStatus::Busy);
        assert_eq!(snap[0].task_state, Some(TaskState::Pinned));
        pool.unmount(c, &t, TaskState::Parked).unwrap();
        assert_eq!(t.state(), TaskState::Parked);
        assert_eq!(t.carrier(), None);
        assert_eq!(pool.snapshot()[0].status, CarrierStatus::Idle);
    }

    #[test]
    fn finish_records_outcome() {
        let pool = CarrierPool::new(1);
        let c = CarrierId::new(0);
        let t = runnable(1);
        pool.mount(c, &t).unwrap();
        pool.finish(c, &t, Ok(())).unwrap();
        assert!(t.is_terminated());
        assert_eq!(t.outcome(), Some(Ok(())));
        assert_eq!(pool.busy(), 0);
    }

    #[test]
    fn wrong_carrier_is_rejected() {
        let pool = CarrierPool::new(2);
        let t = runnable(1);
        pool.mount(CarrierId::new(0), &t).unwrap();
        assert!(pool.unmount(CarrierId::new(1), &t, TaskState::Runnable).is_err());
    }
}
