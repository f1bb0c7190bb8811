// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tasks, carriers and the scheduler that binds them.

pub mod carrier;
pub mod continuation;
pub mod handle;
pub mod pinning;
pub(crate) mod queue;
pub mod scheduler;
pub mod task;

pub use carrier::{CarrierId, CarrierInfo, CarrierPool, CarrierStatus};
pub use continuation::{Continuation, SuspendReason, TaskResult};
pub use handle::{Handle, JoinFuture, TaskBuilder, TaskFactory};
pub use pinning::{PinEvent, PinObserver, PinRecord, PinningMonitor};
pub use scheduler::{Scheduler, SchedulerStats};
pub use task::{TaskId, TaskInfo, TaskState};
