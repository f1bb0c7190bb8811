// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Some tasks fail three calls deep, either by returning an error or by
//! panicking. Neither takes down the carrier; `await_all` hands back every
//! failure at once.

use std::time::{Duration, Instant};

use skein_rt::{sleep, RuntimeError, Scheduler, SchedulerConfig, TaskError, TaskResult};

use super::{task_failures, Report};

pub fn run(
    config: SchedulerConfig,
    tasks: usize,
    fail_every: usize,
) -> Result<Report, RuntimeError> {
    let sched = Scheduler::new(config)?;
    let started = Instant::now();
    let fail_every = fail_every.max(1);

    let factory = sched.factory("worker-", 0);
    let mut ids = Vec::with_capacity(tasks);
    for i in 0..tasks {
        let nth = i + 1;
        let failure = if nth % fail_every != 0 {
            None
        } else if (nth / fail_every) % 2 == 0 {
            Some(Failure::Panic)
        } else {
            Some(Failure::Error)
        };
        ids.push(factory.submit(async move { step_one(i, failure).await })?);
    }

    let failures = task_failures(sched.await_all(&ids))?;
    let lines = vec![
        format!(
            "{} tasks, every {}th one fails (errors and panics alternate)",
            tasks, fail_every
        ),
        format!("{} succeeded", tasks - failures.len()),
    ];
    Ok(Report::finish("failures", &sched, started, lines, failures))
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Error,
    Panic,
}

async fn step_one(i: usize, failure: Option<Failure>) -> TaskResult {
    sleep(Duration::from_millis(5)).await?;
    step_two(i, failure).await
}

async fn step_two(i: usize, failure: Option<Failure>) -> TaskResult {
    sleep(Duration::from_millis(5)).await?;
    step_three(i, failure)
}

fn step_three(i: usize, failure: Option<Failure>) -> TaskResult {
    match failure {
        None => Ok(()),
        Some(Failure::Error) => Err(TaskError::msg(format!("step three rejected job {i}"))),
        Some(Failure::Panic) => panic!("step three gave up on job {i}"),
    }
}
