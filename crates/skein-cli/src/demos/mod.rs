// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Demo programs. Each one builds its own scheduler from the CLI config,
//! runs to completion and returns a [`Report`].

mod cooperative;
mod cpu;
mod factory;
mod failures;
mod io;
mod locks;
mod pinning;
mod race;

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use skein_rt::{
    CarrierId, QueueDiscipline, RuntimeError, Scheduler, SchedulerConfig, SchedulerStats, TaskId,
};

use crate::Demo;

pub fn run(demo: &Demo, config: SchedulerConfig) -> Result<Report, RuntimeError> {
    match *demo {
        Demo::Cooperative { steps } => cooperative::run(config, steps),
        Demo::Io { tasks, sleep_ms } => io::run(config, tasks, sleep_ms),
        Demo::Pinning {
            tasks,
            sleep_ms,
            fix,
        } => pinning::run(config, tasks, sleep_ms, fix),
        Demo::Locks { tasks, hold_ms } => locks::run(config, tasks, hold_ms),
        Demo::Race { tasks, adds } => race::run(config, tasks, adds),
        Demo::Cpu { tasks, n } => cpu::run(config, tasks, n),
        Demo::Factory { parents, children } => factory::run(config, parents, children),
        Demo::Failures { tasks, fail_every } => failures::run(config, tasks, fail_every),
    }
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub demo: &'static str,
    pub carriers: usize,
    pub discipline: QueueDiscipline,
    pub elapsed_ms: u64,
    /// Demo-specific findings, in display order.
    pub lines: Vec<String>,
    pub failures: Vec<String>,
    pub pins: Vec<PinLine>,
    pub stats: SchedulerStats,
}

#[derive(Debug, Serialize)]
pub struct PinLine {
    pub task: TaskId,
    pub task_name: Option<String>,
    pub carrier: CarrierId,
    pub blocker: String,
    /// None while the pin is still open.
    pub blocked_ms: Option<u64>,
}

impl PinLine {
    pub fn task_label(&self) -> String {
        match &self.task_name {
            Some(name) => format!("{}[{}]", self.task, name),
            None => self.task.to_string(),
        }
    }
}

impl Report {
    /// Shut `sched` down and gather what it recorded.
    fn finish(
        demo: &'static str,
        sched: &Scheduler,
        started: Instant,
        lines: Vec<String>,
        failures: Vec<String>,
    ) -> Self {
        let elapsed_ms = millis(started.elapsed());
        sched.shutdown();
        let pins = sched
            .pin_records()
            .into_iter()
            .map(|record| PinLine {
                task: record.event.task,
                task_name: record.event.task_name,
                carrier: record.event.carrier,
                blocker: record.event.blocker.to_string(),
                blocked_ms: record.blocked_for.map(millis),
            })
            .collect();
        Report {
            demo,
            carriers: sched.config().resolved_carriers(),
            discipline: sched.config().discipline,
            elapsed_ms,
            lines,
            failures,
            pins,
            stats: sched.stats(),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Split an `await_all` result into expected task failures and real
/// runtime errors.
fn task_failures(result: Result<(), RuntimeError>) -> Result<Vec<String>, RuntimeError> {
    match result {
        Ok(()) => Ok(Vec::new()),
        Err(RuntimeError::Aggregate(agg)) => {
            Ok(agg.failures().iter().map(ToString::to_string).collect())
        }
        Err(e) => Err(e),
    }
}

/// Poll `cond` from the calling thread, giving up after a few seconds.
fn spin_until(mut cond: impl FnMut() -> bool) {
    let give_up = Instant::now() + Duration::from_secs(5);
    while !cond() && Instant::now() < give_up {
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Append-only log shared between tasks.
#[derive(Debug, Default)]
struct Trace(Mutex<Vec<String>>);

impl Trace {
    fn push(&self, line: impl Into<String>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.into());
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
