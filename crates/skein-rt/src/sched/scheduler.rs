// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! M:N scheduler.
//!
//! A fixed pool of carrier threads pulls runnable tasks from the run
//! queues and resumes them. After each resume the carrier looks at why
//! the task stopped:
//!
//! - yielded: back to the tail of a run queue, carrier freed
//! - parked, outside a native section: unmounted, carrier freed, the
//!   task's waker re-queues it later
//! - parked inside a native section: pinned, the carrier thread blocks
//!   until the task is woken or leaves the section
//! - completed or failed: outcome stored, carrier freed
//!
//! A dedicated timer thread serves sleeps and timed waits.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use indexmap::IndexMap;

use super::carrier::{CarrierId, CarrierPool};
use super::continuation::{Continuation, SuspendReason, TaskResult};
use super::handle::Handle;
use super::pinning::{PinTicket, PinningMonitor};
use super::queue::{InjectorQueue, LocalQueue};
use super::task::{PinWait, Task, TaskId, TaskState};
use crate::config::{QueueDiscipline, SchedulerConfig};
use crate::context;
use crate::error::{RuntimeError, TaskError};
use crate::timer::Timer;
use crate::util::{lock, wait_timeout};

/// Under per-carrier queues, look at the global queue first every this
/// many picks so injected tasks can't starve.
const GLOBAL_CHECK_INTERVAL: u64 = 31;

/// Tasks moved from the global queue to a local one per refill.
const GLOBAL_BATCH: usize = 4;

/// Upper bound between re-checks of the stop flag in blocking waits.
pub(crate) const STOP_POLL: Duration = Duration::from_millis(50);

static NEXT_SCHEDULER: AtomicUsize = AtomicUsize::new(1);

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    yields: AtomicU64,
    parks: AtomicU64,
    pins: AtomicU64,
    steals: AtomicU64,
    mounts: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Counters since the scheduler started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SchedulerStats {
    pub carriers: usize,
    pub busy_carriers: usize,
    pub live: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub yields: u64,
    pub parks: u64,
    pub pins: u64,
    pub steals: u64,
    pub mounts: u64,
}

/// State shared by carriers, the timer, wakers and handles.
pub(crate) struct Shared {
    uid: usize,
    pub(crate) config: SchedulerConfig,
    pub(crate) pool: CarrierPool,
    /// One per carrier under `PerCarrier`, empty under `Global`.
    local_queues: Vec<LocalQueue>,
    injector: InjectorQueue,
    pub(crate) monitor: PinningMonitor,
    timer: Arc<Timer>,
    /// Every task not yet reaped, terminated ones included.
    tasks: Mutex<IndexMap<TaskId, Arc<Task>>>,
    next_id: AtomicU64,
    live: AtomicUsize,
    /// Bumped on every termination; awaiters sleep on the condvar.
    completions: (Mutex<u64>, Condvar),
    stopping: AtomicBool,
    counters: Counters,
}

impl Shared {
    pub(crate) fn uid(&self) -> usize {
        self.uid
    }

    pub(crate) fn timer(&self) -> Arc<Timer> {
        Arc::clone(&self.timer)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn lookup(&self, id: TaskId) -> Result<Arc<Task>, RuntimeError> {
        lock(&self.tasks)
            .get(&id)
            .cloned()
            .ok_or(RuntimeError::UnknownTask(id))
    }

    pub(crate) fn all_tasks(&self) -> Vec<Arc<Task>> {
        lock(&self.tasks).values().cloned().collect()
    }

    /// Drop terminated tasks from the arena. Returns how many.
    pub(crate) fn reap(&self) -> usize {
        let mut tasks = lock(&self.tasks);
        let before = tasks.len();
        tasks.retain(|_, t| !t.is_terminated());
        before - tasks.len()
    }

    pub(crate) fn stats(&self) -> SchedulerStats {
        let c = &self.counters;
        SchedulerStats {
            carriers: self.pool.len(),
            busy_carriers: self.pool.busy(),
            live: self.live(),
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            yields: c.yields.load(Ordering::Relaxed),
            parks: c.parks.load(Ordering::Relaxed),
            pins: c.pins.load(Ordering::Relaxed),
            steals: c.steals.load(Ordering::Relaxed),
            mounts: c.mounts.load(Ordering::Relaxed),
        }
    }

    /// Block the calling thread until `done` holds under the completion
    /// lock, the scheduler stops, or `timeout` (per wait) elapses.
    pub(crate) fn wait_completions<T>(
        &self,
        mut check: impl FnMut() -> Option<T>,
        mut next_wait: impl FnMut() -> Result<Duration, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        let (gen, cvar) = &self.completions;
        let mut guard = lock(gen);
        loop {
            if let Some(done) = check() {
                return Ok(done);
            }
            if self.is_stopping() {
                return Err(RuntimeError::ShutDown);
            }
            let wait = next_wait()?;
            guard = wait_timeout(cvar, guard, wait);
        }
    }

    fn notify_completion(&self) {
        let (gen, cvar) = &self.completions;
        *lock(gen) += 1;
        cvar.notify_all();
    }

    // ---- submission and queueing ----

    pub(crate) fn spawn(
        self: &Arc<Self>,
        name: Option<String>,
        continuation: Continuation,
    ) -> Result<TaskId, RuntimeError> {
        if self.is_stopping() {
            return Err(RuntimeError::ShutDown);
        }
        let id = TaskId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = Arc::new(Task::new(id, name, continuation, Arc::downgrade(self)));
        lock(&self.tasks).insert(id, Arc::clone(&task));
        self.live.fetch_add(1, Ordering::AcqRel);
        bump(&self.counters.submitted);

        let queued = task.transition(TaskState::New, TaskState::Runnable);
        debug_assert!(queued);
        tracing::debug!(task = %id, name = task.name().unwrap_or(""), "submitted");
        self.injector.push(task);
        self.notify_idle();
        Ok(id)
    }

    /// Queue a RUNNABLE task. A carrier of this scheduler re-queues to its
    /// own local queue when it has one; everyone else goes global.
    pub(crate) fn enqueue(&self, task: Arc<Task>) {
        let local = context::carrier_of(self.uid).and_then(|c| self.local_queues.get(c.index()));
        let task = match local {
            Some(queue) => match queue.push(task) {
                Ok(()) => {
                    self.notify_idle();
                    return;
                }
                Err(overflow) => {
                    tracing::trace!(task = %overflow.id(), "local queue full, using global queue");
                    overflow
                }
            },
            None => task,
        };
        self.injector.push(task);
        self.notify_idle();
    }

    pub(crate) fn enqueue_batch(&self, tasks: Vec<Arc<Task>>) {
        if tasks.is_empty() {
            return;
        }
        tracing::trace!(count = tasks.len(), "batch wake");
        self.injector.push_batch(tasks);
        self.pool.unpark_all();
    }

    fn notify_idle(&self) {
        if let Some(id) = self.pool.acquire_idle() {
            self.pool.unpark(id);
        }
    }

    fn has_work(&self, id: CarrierId) -> bool {
        !self.injector.is_empty()
            || self
                .local_queues
                .get(id.index())
                .is_some_and(|q| !q.is_empty())
    }

    // ---- carrier side ----

    fn carrier_loop(&self, id: CarrierId) {
        context::enter_carrier(self.uid, id);
        tracing::debug!(carrier = %id, "carrier started");
        let mut tick = 0u64;
        let mut rng = (id.index() as u64).wrapping_add(0x9E37_79B9_7F4A_7C15);
        while !self.is_stopping() {
            match self.next_task(id, &mut tick, &mut rng) {
                Some(task) => self.run_task(id, task),
                None if self.has_work(id) => {}
                None => self.pool.park(id, self.config.idle_park),
            }
        }
        context::exit_carrier();
        tracing::debug!(carrier = %id, "carrier stopped");
    }

    fn next_task(&self, id: CarrierId, tick: &mut u64, rng: &mut u64) -> Option<Arc<Task>> {
        let Some(local) = self.local_queues.get(id.index()) else {
            return self.injector.pop();
        };
        *tick = tick.wrapping_add(1);
        if *tick % GLOBAL_CHECK_INTERVAL == 0 {
            if let Some(task) = self.injector.pop() {
                return Some(task);
            }
        }
        if let Some(task) = local.pop() {
            return Some(task);
        }
        let mut refill = self.injector.pop_batch(GLOBAL_BATCH).into_iter();
        if let Some(first) = refill.next() {
            for task in refill {
                if let Err(task) = local.push(task) {
                    self.injector.push(task);
                }
            }
            return Some(first);
        }
        self.steal(id, local, rng)
    }

    fn steal(&self, id: CarrierId, local: &LocalQueue, rng: &mut u64) -> Option<Arc<Task>> {
        let n = self.local_queues.len();
        if n < 2 {
            return None;
        }
        let start = (xorshift64(rng) as usize) % n;
        for offset in 0..n {
            let victim = (start + offset) % n;
            if victim == id.index() {
                continue;
            }
            let mut stolen = self.local_queues[victim].steal_batch().into_iter();
            if let Some(first) = stolen.next() {
                let count = stolen.len() + 1;
                for task in stolen {
                    if let Err(task) = local.push(task) {
                        self.injector.push(task);
                    }
                }
                bump(&self.counters.steals);
                tracing::debug!(carrier = %id, victim, count, "stole tasks");
                return Some(first);
            }
        }
        None
    }

    fn run_task(&self, carrier: CarrierId, task: Arc<Task>) {
        if let Err(e) = self.pool.mount(carrier, &task) {
            tracing::error!(carrier = %carrier, task = %task.id(), error = %e, "mount failed");
            return;
        }
        bump(&self.counters.mounts);
        let span = tracing::debug_span!("task", id = %task.id(), carrier = %carrier);
        let _entered = span.enter();
        tracing::debug!("mounted");

        loop {
            tracing::trace!("resume");
            let reason = task
                .resume()
                .unwrap_or_else(|e| SuspendReason::Failed(TaskError::Runtime(e)));
            match reason {
                SuspendReason::Completed => return self.complete(carrier, &task, Ok(())),
                SuspendReason::Failed(e) => return self.complete(carrier, &task, Err(e)),
                SuspendReason::Yielded | SuspendReason::Cancelled => {
                    if matches!(reason, SuspendReason::Yielded) {
                        bump(&self.counters.yields);
                    }
                    if !self.monitor.can_unmount(&task) && !self.is_stopping() {
                        // Pinned: the task keeps its carrier.
                        continue;
                    }
                    if self.unmount(carrier, &task, TaskState::Runnable) {
                        tracing::debug!(%reason, "unmounted");
                        self.enqueue(task);
                    }
                    return;
                }
                SuspendReason::ParkedOn(blocker) => {
                    bump(&self.counters.parks);
                    if self.monitor.can_unmount(&task) {
                        return self.park(carrier, &task, blocker);
                    }
                    match self.pin(carrier, &task, blocker) {
                        Some(PinWait::Woken) => match self.pool.resume_pinned(carrier, &task) {
                            Ok(()) => continue,
                            Err(e) => {
                                tracing::error!(error = %e, "resume after pin failed");
                                return;
                            }
                        },
                        Some(PinWait::Unpinned) => return self.park(carrier, &task, blocker),
                        Some(PinWait::ShutDown) => {
                            self.unmount(carrier, &task, TaskState::Parked);
                            return;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    fn unmount(&self, carrier: CarrierId, task: &Arc<Task>, to: TaskState) -> bool {
        match self.pool.unmount(carrier, task, to) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "unmount failed");
                false
            }
        }
    }

    fn park(&self, carrier: CarrierId, task: &Arc<Task>, blocker: crate::sync::Blocker) {
        if !self.unmount(carrier, task, TaskState::Parked) {
            return;
        }
        tracing::debug!(%blocker, "parked");
        if task.after_park() {
            self.enqueue(Arc::clone(task));
        }
    }

    /// Keep the carrier and wait in place. `None` if the pin transition
    /// itself failed.
    fn pin(
        &self,
        carrier: CarrierId,
        task: &Arc<Task>,
        blocker: crate::sync::Blocker,
    ) -> Option<PinWait> {
        if let Err(e) = self.pool.pin(carrier, task) {
            tracing::error!(error = %e, "pin failed");
            return None;
        }
        bump(&self.counters.pins);
        let ticket: PinTicket = self.monitor.report(task, carrier, blocker);
        let outcome = task.wait_pinned(
            self.config.pin_recheck,
            |t| self.monitor.can_unmount(t),
            || self.is_stopping(),
        );
        self.monitor.release(ticket);
        tracing::debug!(?outcome, "pin ended");
        Some(outcome)
    }

    fn complete(&self, carrier: CarrierId, task: &Arc<Task>, outcome: TaskResult) {
        match &outcome {
            Ok(()) => {
                bump(&self.counters.completed);
                tracing::debug!("completed");
            }
            Err(e) => {
                bump(&self.counters.failed);
                tracing::debug!(error = %e, "failed");
            }
        }
        if let Err(e) = self.pool.finish(carrier, task, outcome) {
            tracing::error!(error = %e, "finish failed");
        }
        for waker in task.take_join_wakers() {
            waker.wake();
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.notify_completion();
    }
}

/// xorshift64 for victim selection.
fn xorshift64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

/// Owns the carrier and timer threads. Dereferences to its [`Handle`].
///
/// Dropping the scheduler stops it without waiting for live tasks.
pub struct Scheduler {
    handle: Handle,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// Start carriers and the timer thread.
    pub fn new(config: SchedulerConfig) -> Result<Self, RuntimeError> {
        let carriers = config.resolved_carriers();
        let local_queues = match config.discipline {
            QueueDiscipline::Global => Vec::new(),
            QueueDiscipline::PerCarrier => (0..carriers)
                .map(|_| LocalQueue::with_capacity(config.local_queue_capacity))
                .collect(),
        };
        let shared = Arc::new(Shared {
            uid: NEXT_SCHEDULER.fetch_add(1, Ordering::Relaxed),
            pool: CarrierPool::new(carriers),
            local_queues,
            injector: InjectorQueue::new(),
            monitor: PinningMonitor::new(config.pin_sink.clone(), config.pin_history),
            timer: Timer::new(),
            tasks: Mutex::new(IndexMap::new()),
            next_id: AtomicU64::new(1),
            live: AtomicUsize::new(0),
            completions: (Mutex::new(0), Condvar::new()),
            stopping: AtomicBool::new(false),
            counters: Counters::default(),
            config,
        });

        let scheduler = Self {
            handle: Handle::new(Arc::clone(&shared)),
            threads: Mutex::new(Vec::with_capacity(carriers + 1)),
        };

        let timer = shared.timer();
        scheduler.start_thread("skein-timer".to_string(), move || timer.run())?;
        for id in shared.pool.ids() {
            let s = Arc::clone(&shared);
            let name = format!("{}-{}", shared.config.thread_name, id.index());
            scheduler.start_thread(name, move || s.carrier_loop(id))?;
        }

        tracing::info!(
            carriers,
            discipline = %shared.config.discipline,
            "scheduler started"
        );
        Ok(scheduler)
    }

    /// Defaults with `n` carriers.
    pub fn with_carriers(n: usize) -> Result<Self, RuntimeError> {
        Self::new(SchedulerConfig::default().with_carriers(n))
    }

    fn start_thread(
        &self,
        name: String,
        body: impl FnOnce() + Send + 'static,
    ) -> Result<(), RuntimeError> {
        match thread::Builder::new().name(name.clone()).spawn(body) {
            Ok(handle) => {
                lock(&self.threads).push(handle);
                Ok(())
            }
            Err(e) => {
                // Dropping `self` stops whatever already started.
                Err(RuntimeError::Spawn(format!("{name}: {e}")))
            }
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Wait for every live task to terminate, then stop carriers and the
    /// timer. Submissions made after this returns fail with `ShutDown`.
    pub fn shutdown(&self) {
        let shared = self.handle.shared();
        let _ = shared.wait_completions(
            || (shared.live() == 0).then_some(()),
            || Ok(STOP_POLL),
        );
        self.stop();
    }

    /// Stop without waiting. Unfinished tasks are dropped where they are.
    pub fn shutdown_now(&self) {
        self.stop();
    }

    fn stop(&self) {
        let shared = self.handle.shared();
        let first = !shared.stopping.swap(true, Ordering::AcqRel);
        shared.pool.unpark_all();
        shared.timer.shutdown();
        shared.notify_completion();

        let threads = std::mem::take(&mut *lock(&self.threads));
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("runtime thread panicked");
            }
        }

        if first {
            let mut abandoned = 0usize;
            for task in shared.all_tasks() {
                if !task.is_terminated() {
                    task.discard_continuation();
                    abandoned += 1;
                }
            }
            tracing::info!(abandoned, "scheduler stopped");
        }
    }
}

impl Deref for Scheduler {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
