// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Many tasks each sleep once. Sleeping parks the task, so the carriers
//! stay free and the whole batch takes about one sleep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use skein_rt::{sleep, CountDownLatch, RuntimeError, Scheduler, SchedulerConfig};

use super::{Report, Trace};

pub fn run(config: SchedulerConfig, tasks: usize, sleep_ms: u64) -> Result<Report, RuntimeError> {
    let sched = Scheduler::new(config)?;
    let done = Arc::new(CountDownLatch::new(tasks));
    let trace = Arc::new(Trace::default());
    let started = Instant::now();

    let factory = sched.factory("io-", 0);
    for _ in 0..tasks {
        let done = Arc::clone(&done);
        let trace = Arc::clone(&trace);
        factory.submit(async move {
            sleep(Duration::from_millis(sleep_ms)).await?;
            if let Some(name) = skein_rt::current_task_name() {
                if name == "io-0" {
                    trace.push(format!("{name} woke on {}", skein_rt::describe_current()));
                }
            }
            done.count_down();
            Ok(())
        })?;
    }

    // The main thread is not a task; it blocks on the latch directly.
    done.wait_blocking();
    let took = started.elapsed();
    let serial =
        Duration::from_millis(sleep_ms).saturating_mul(u32::try_from(tasks).unwrap_or(u32::MAX));

    let mut lines = vec![
        format!(
            "{} tasks x {} ms sleep finished in {} ms",
            tasks,
            sleep_ms,
            took.as_millis()
        ),
        format!("one after another this would take {} ms", serial.as_millis()),
    ];
    lines.extend(trace.take());
    Ok(Report::finish("io", &sched, started, lines, Vec::new()))
}
