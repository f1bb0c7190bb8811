// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Run queues.
//!
//! `InjectorQueue` is the global FIFO: submissions, wakes from non-carrier
//! threads and local overflow land there. Under the per-carrier discipline
//! each carrier also owns a bounded `LocalQueue`; peers steal half of it
//! from the back when they run dry.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::task::Task;
use crate::util::lock;

/// Bounded per-carrier FIFO. The owner pops from the front, stealers take
/// from the back.
pub(crate) struct LocalQueue {
    deque: Mutex<VecDeque<Arc<Task>>>,
    capacity: usize,
}

impl LocalQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            deque: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Push a task. Hands it back if the queue is full.
    pub fn push(&self, task: Arc<Task>) -> Result<(), Arc<Task>> {
        let mut q = lock(&self.deque);
        if q.len() >= self.capacity {
            return Err(task);
        }
        q.push_back(task);
        Ok(())
    }

    pub fn pop(&self) -> Option<Arc<Task>> {
        lock(&self.deque).pop_front()
    }

    /// Take half the queue from the back, at least one task if any.
    pub fn steal_batch(&self) -> Vec<Arc<Task>> {
        let mut q = lock(&self.deque);
        let count = (q.len() / 2).max(q.len().min(1));
        let mut stolen = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(task) = q.pop_back() {
                stolen.push(task);
            }
        }
        // Back-to-front; restore submission order for the thief.
        stolen.reverse();
        stolen
    }

    pub fn len(&self) -> usize {
        lock(&self.deque).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.deque).is_empty()
    }
}

#[derive(Default)]
pub(crate) struct InjectorQueue {
    queue: Mutex<VecDeque<Arc<Task>>>,
}

impl InjectorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: Arc<Task>) {
        lock(&self.queue).push_back(task);
    }

    pub fn push_batch(&self, tasks: Vec<Arc<Task>>) {
        lock(&self.queue).extend(tasks);
    }

    pub fn pop(&self) -> Option<Arc<Task>> {
        lock(&self.queue).pop_front()
    }

    /// Pop up to `n` tasks at once.
    pub fn pop_batch(&self, n: usize) -> Vec<Arc<Task>> {
        let mut q = lock(&self.queue);
        let count = n.min(q.len());
        q.drain(..count).collect()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::continuation::Continuation;
    use crate::sched::task::TaskId;
    use std::sync::Weak;

    fn task(id: u64) -> Arc<Task> {
        Arc::new(Task::new(
            TaskId::from_raw(id),
            None,
            Continuation::new(async { Ok(()) }),
            Weak::new(),
        ))
    }

    fn ids(tasks: &[Arc<Task>]) -> Vec<u64> {
        tasks.iter().map(|t| t.id().as_u64()).collect()
    }

    #[test]
    fn local_queue_is_fifo() {
        let q = LocalQueue::with_capacity(8);
        q.push(task(1)).unwrap();
        q.push(task(2)).unwrap();
        assert_eq!(q.pop().map(|t| t.id().as_u64()), Some(1));
        assert_eq!(q.pop().map(|t| t.id().as_u64()), Some(2));
        assert!(q.is_empty());
    }

    #[test]
    fn local_queue_overflow() {
        let q = LocalQueue::with_capacity(4);
        for i in 0..4 {
            q.push(task(i)).unwrap();
        }
        let rejected = q.push(task(99)).unwrap_err();
        assert_eq!(rejected.id().as_u64(), 99);
    }

    #[test]
    fn steal_takes_the_back_half_in_order() {
        let q = LocalQueue::with_capacity(16);
        for i in 1..=10 {
            q.push(task(i)).unwrap();
        }
        let stolen = q.steal_batch();
        assert_eq!(ids(&stolen), vec![6, 7, 8, 9, 10]);
        assert_eq!(q.len(), 5);
    }

    #[test]
    fn steal_at_least_one() {
        let q = LocalQueue::with_capacity(4);
        assert!(q.steal_batch().is_empty());
        q.push(task(1)).unwrap();
        assert_eq!(q.steal_batch().len(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn injector_batch_ops() {
        let q = InjectorQueue::new();
        q.push_batch((1..=5).map(task).collect());
        assert_eq!(q.len(), 5);
        assert_eq!(ids(&q.pop_batch(3)), vec![1, 2, 3]);
        assert_eq!(q.pop().map(|t| t.id().as_u64()), Some(4));
        assert_eq!(q.len(), 1);
    }
}
