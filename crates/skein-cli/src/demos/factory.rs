// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Named tasks from factories. Every parent spawns its children from
//! inside the task and joins them before finishing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use skein_rt::{
    current_task_name, describe_current, sleep, RuntimeError, Scheduler, SchedulerConfig,
};

use super::{task_failures, Report, Trace};

pub fn run(
    config: SchedulerConfig,
    parents: usize,
    children: usize,
) -> Result<Report, RuntimeError> {
    let sched = Scheduler::new(config)?;
    let trace = Arc::new(Trace::default());
    let started = Instant::now();

    let parent_factory = sched.factory("parent-", 0);
    let child_factory = sched.factory("child-", 0);
    let mut ids = Vec::with_capacity(parents);
    for _ in 0..parents {
        let spawner = child_factory.clone();
        let trace = Arc::clone(&trace);
        ids.push(parent_factory.submit(async move {
            let me = current_task_name().unwrap_or_default();
            let mut kids = Vec::with_capacity(children);
            for _ in 0..children {
                let trace = Arc::clone(&trace);
                let parent = me.clone();
                kids.push(spawner.submit(async move {
                    sleep(Duration::from_millis(10)).await?;
                    trace.push(format!("{} (spawned by {})", describe_current(), parent));
                    Ok(())
                })?);
            }
            for kid in kids {
                spawner.handle().join(kid).await?;
            }
            trace.push(format!("{} joined {} children", me, children));
            Ok(())
        })?);
    }

    let failures = task_failures(sched.await_all(&ids))?;
    let mut lines = trace.take();
    lines.sort();
    Ok(Report::finish("factory", &sched, started, lines, failures))
}
