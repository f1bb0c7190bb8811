// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Skein: lightweight tasks multiplexed over a small pool of carrier
//! threads.
//!
//! Tasks are stackless continuations. When one blocks on a skein
//! primitive (lock, latch, signal, sleep, join) it leaves its carrier and
//! the carrier picks up other work. Inside a native section (see
//! [`enter_native`], [`NativeMonitor`]) it can't leave, and the carrier is
//! pinned until the task resumes; those pins are reported.
//!
//! Components:
//! - sched: continuations, tasks, carrier pool, scheduler, pin monitor
//! - sync: reentrant lock, countdown latch, signal, native monitor
//! - timer: sleep and deadlines
//! - context: current task, yield, native sections

pub mod cancel;
pub mod config;
pub mod context;
pub mod error;
pub mod sched;
pub mod sync;
pub mod timer;
mod util;

pub use config::{PinSink, QueueDiscipline, SchedulerConfig};
pub use context::{
    current_carrier, current_task, current_task_name, describe_current, enter_native,
    is_cancelled, yield_now, NativeSection, YieldNow,
};
pub use error::{AggregateFailure, RuntimeError, TaskError, TaskFailure};
pub use sched::{
    CarrierId, CarrierInfo, CarrierStatus, Continuation, Handle, JoinFuture, PinEvent,
    PinObserver, PinRecord, Scheduler, SchedulerStats, SuspendReason, TaskBuilder, TaskFactory,
    TaskId, TaskInfo, TaskResult, TaskState,
};
pub use sync::{
    Blocker, CountDownLatch, NativeMonitor, PrimitiveId, PrimitiveKind, ReentrantLock, Signal,
};
pub use timer::{sleep, sleep_until, Sleep};
