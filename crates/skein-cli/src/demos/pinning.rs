// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tasks sleep while holding a shared lock. With a native monitor the
//! sleeping holder pins its carrier and waiting tasks block theirs, so
//! unrelated bystander tasks queue up behind them. `--fix` swaps in a
//! skein lock: holders and waiters park, and bystanders run at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use skein_rt::{
    sleep, NativeMonitor, ReentrantLock, RuntimeError, Scheduler, SchedulerConfig, TaskId,
};

use super::{millis, task_failures, Report};

const BYSTANDERS: usize = 4;

pub fn run(
    config: SchedulerConfig,
    tasks: usize,
    sleep_ms: u64,
    fix: bool,
) -> Result<Report, RuntimeError> {
    let sched = Scheduler::new(config)?;
    let nap = Duration::from_millis(sleep_ms);
    let started = Instant::now();
    let mut ids: Vec<TaskId> = Vec::new();

    let workers = sched.factory("worker-", 0);
    if fix {
        let lock = Arc::new(ReentrantLock::new());
        for _ in 0..tasks {
            let lock = Arc::clone(&lock);
            ids.push(workers.submit(async move {
                lock.lock().await?;
                let slept = sleep(nap).await;
                lock.unlock()?;
                slept?;
                Ok(())
            })?);
        }
    } else {
        let monitor = Arc::new(NativeMonitor::new());
        for _ in 0..tasks {
            let monitor = Arc::clone(&monitor);
            ids.push(workers.submit(async move {
                let _held = monitor.enter();
                sleep(nap).await?;
                Ok(())
            })?);
        }
    }

    // Slowest bystander start, in ms since the demo began.
    let worst = Arc::new(AtomicU64::new(0));
    let bystanders = sched.factory("bystander-", 0);
    for _ in 0..BYSTANDERS {
        let worst = Arc::clone(&worst);
        ids.push(bystanders.submit(async move {
            worst.fetch_max(millis(started.elapsed()), Ordering::Relaxed);
            Ok(())
        })?);
    }

    let failures = task_failures(sched.await_all(&ids))?;
    let worst = worst.load(Ordering::Relaxed);

    let guard = if fix { "skein lock" } else { "native monitor" };
    let lines = vec![
        format!("{} workers slept {} ms each holding a {}", tasks, sleep_ms, guard),
        format!("slowest bystander started after {} ms", worst),
    ];
    Ok(Report::finish("pinning", &sched, started, lines, failures))
}
