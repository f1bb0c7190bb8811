// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Three tasks on a single carrier. `t1` and `t2` yield on even steps,
//! `t3` never does, so it runs its steps back to back once mounted.

use std::sync::Arc;
use std::time::Instant;

use skein_rt::{yield_now, RuntimeError, Scheduler, SchedulerConfig};

use super::{task_failures, Report, Trace};

pub fn run(config: SchedulerConfig, steps: usize) -> Result<Report, RuntimeError> {
    let sched = Scheduler::new(config.with_carriers(1))?;
    let trace = Arc::new(Trace::default());
    let started = Instant::now();

    let mut ids = Vec::new();
    for (name, yields) in [("t1", true), ("t2", true), ("t3", false)] {
        let trace = Arc::clone(&trace);
        let id = sched.builder().name(name).submit(async move {
            for step in 0..steps {
                trace.push(format!("{name}:{step}"));
                tracing::info!(step, "{name}");
                if yields && step % 2 == 0 {
                    yield_now().await?;
                }
            }
            Ok(())
        })?;
        ids.push(id);
    }

    let failures = task_failures(sched.await_all(&ids))?;
    let order = trace.take();
    let switches = order
        .windows(2)
        .filter(|pair| task_of(&pair[0]) != task_of(&pair[1]))
        .count();
    let lines = vec![
        format!("order: {}", order.join(" ")),
        format!("{} steps, {} switches between tasks", order.len(), switches),
    ];
    Ok(Report::finish("cooperative", &sched, started, lines, failures))
}

fn task_of(step: &str) -> &str {
    step.split(':').next().unwrap_or(step)
}
