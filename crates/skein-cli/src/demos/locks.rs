// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! A fair lock: once the first holder is in, every later task queues and
//! ownership is handed over strictly in arrival order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use skein_rt::{
    current_task_name, sleep, CountDownLatch, ReentrantLock, RuntimeError, Scheduler,
    SchedulerConfig,
};

use super::{spin_until, task_failures, Report, Trace};

pub fn run(config: SchedulerConfig, tasks: usize, hold_ms: u64) -> Result<Report, RuntimeError> {
    let sched = Scheduler::new(config)?;
    let lock = Arc::new(ReentrantLock::new());
    let order = Arc::new(Trace::default());
    let hold = Duration::from_millis(hold_ms);
    let started = Instant::now();

    // The first task takes the lock and keeps it until everyone queued.
    let queued = Arc::new(CountDownLatch::new(1));
    let mut ids = Vec::with_capacity(tasks + 1);
    {
        let shared = Arc::clone(&lock);
        let queued = Arc::clone(&queued);
        let order = Arc::clone(&order);
        ids.push(sched.builder().name("opener").submit(async move {
            shared.lock().await?;
            order.push("opener");
            let waited = queued.wait().await;
            shared.unlock()?;
            waited?;
            Ok(())
        })?);
    }
    spin_until(|| lock.is_locked());

    let factory = sched.factory("locker-", 0);
    for _ in 0..tasks {
        let shared = Arc::clone(&lock);
        let order = Arc::clone(&order);
        let id = factory.submit(async move {
            shared.lock().await?;
            // Reentrant: a nested acquire only bumps the hold count.
            shared.lock().await?;
            order.push(current_task_name().unwrap_or_default());
            let slept = sleep(hold).await;
            shared.unlock()?;
            shared.unlock()?;
            slept?;
            Ok(())
        })?;
        // Wait until it is queued so arrival order is the submit order.
        let ahead = ids.len();
        spin_until(|| {
            lock.queue_len() >= ahead || sched.task_state(id).is_some_and(|s| s.is_terminal())
        });
        ids.push(id);
    }
    queued.count_down();

    let failures = task_failures(sched.await_all(&ids))?;
    let acquired = order.take();
    let expected: Vec<String> = std::iter::once("opener".to_string())
        .chain((0..tasks).map(|n| format!("locker-{n}")))
        .collect();
    let lines = vec![
        format!("acquired: {}", acquired.join(" -> ")),
        if acquired == expected {
            "ownership followed arrival order".to_string()
        } else {
            "ownership did not follow arrival order".to_string()
        },
    ];
    Ok(Report::finish("locks", &sched, started, lines, failures))
}
