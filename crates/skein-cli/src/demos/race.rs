// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Read-modify-write with a suspension point in the middle. Without a
//! lock, tasks overwrite each other's increments; with one, every
//! increment lands.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use skein_rt::{yield_now, ReentrantLock, RuntimeError, Scheduler, SchedulerConfig, TaskId};

use super::{task_failures, Report};

pub fn run(config: SchedulerConfig, tasks: usize, adds: usize) -> Result<Report, RuntimeError> {
    let sched = Scheduler::new(config)?;
    let started = Instant::now();
    let expected = (tasks * adds) as u64;

    let racy = Arc::new(AtomicU64::new(0));
    let mut ids: Vec<TaskId> = Vec::with_capacity(tasks * 2);
    let unlocked = sched.factory("racy-", 0);
    for _ in 0..tasks {
        let counter = Arc::clone(&racy);
        ids.push(unlocked.submit(async move {
            for _ in 0..adds {
                let seen = counter.load(Ordering::SeqCst);
                yield_now().await?;
                counter.store(seen + 1, Ordering::SeqCst);
            }
            Ok(())
        })?);
    }
    let mut failures = task_failures(sched.await_all(&ids))?;

    let exact = Arc::new(AtomicU64::new(0));
    let lock = Arc::new(ReentrantLock::new());
    let locked = sched.factory("locked-", 0);
    ids.clear();
    for _ in 0..tasks {
        let counter = Arc::clone(&exact);
        let lock = Arc::clone(&lock);
        ids.push(locked.submit(async move {
            for _ in 0..adds {
                lock.lock().await?;
                let seen = counter.load(Ordering::SeqCst);
                let yielded = yield_now().await;
                counter.store(seen + 1, Ordering::SeqCst);
                lock.unlock()?;
                yielded?;
            }
            Ok(())
        })?);
    }
    failures.extend(task_failures(sched.await_all(&ids))?);

    let racy = racy.load(Ordering::SeqCst);
    let exact = exact.load(Ordering::SeqCst);
    let lines = vec![
        format!("expected {} increments", expected),
        format!(
            "without a lock: {} ({} lost)",
            racy,
            expected.saturating_sub(racy)
        ),
        format!("with a lock:    {}", exact),
    ];
    Ok(Report::finish("race", &sched, started, lines, failures))
}
