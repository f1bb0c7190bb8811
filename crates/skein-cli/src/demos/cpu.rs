// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! CPU-bound work. Tasks never suspend while computing, so throughput is
//! bounded by the carrier count; the same batch on one OS thread per job
//! is timed for comparison.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use skein_rt::{CountDownLatch, RuntimeError, Scheduler, SchedulerConfig};

use super::{Report, Trace};

pub fn run(config: SchedulerConfig, tasks: Option<usize>, n: u32) -> Result<Report, RuntimeError> {
    let sched = Scheduler::new(config)?;
    let tasks = tasks.unwrap_or_else(|| sched.config().resolved_carriers() * 3);
    let started = Instant::now();

    // Submitted tasks park on `go` so the batch starts together.
    let go = Arc::new(CountDownLatch::new(1));
    let done = Arc::new(CountDownLatch::new(tasks));
    let results = Arc::new(Trace::default());
    let factory = sched.factory("fib-", 0);
    for _ in 0..tasks {
        let go = Arc::clone(&go);
        let done = Arc::clone(&done);
        let results = Arc::clone(&results);
        factory.submit(async move {
            go.wait().await?;
            let value = fib(n);
            results.push(value.to_string());
            done.count_down();
            Ok(())
        })?;
    }
    let t0 = Instant::now();
    go.count_down();
    done.wait_blocking();
    let on_tasks = t0.elapsed();

    let t0 = Instant::now();
    let threads: Vec<_> = (0..tasks).map(|_| thread::spawn(move || fib(n))).collect();
    let mut thread_failures = Vec::new();
    for (i, handle) in threads.into_iter().enumerate() {
        if handle.join().is_err() {
            thread_failures.push(format!("thread {i} panicked"));
        }
    }
    let on_threads = t0.elapsed();

    let answers = results.take();
    let agree = answers.iter().all(|a| *a == fib(n).to_string());
    let lines = vec![
        format!("{} x fib({}) = {}", tasks, n, answers.first().map_or("-", String::as_str)),
        format!(
            "on {} carriers: {} ms",
            sched.config().resolved_carriers(),
            on_tasks.as_millis()
        ),
        format!("one OS thread each: {} ms", on_threads.as_millis()),
        if agree {
            "all results agree".to_string()
        } else {
            "results disagree".to_string()
        },
    ];
    Ok(Report::finish("cpu", &sched, started, lines, thread_failures))
}

fn fib(n: u32) -> u64 {
    if n < 2 {
        u64::from(n)
    } else {
        fib(n - 1) + fib(n - 2)
    }
}
