// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler configuration.
//!
//! Read once by `Scheduler::new`. `from_env()` layers `SKEIN_*` variables
//! over the defaults.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::sched::pinning::PinObserver;

/// Where runnable tasks wait for a carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum QueueDiscipline {
    /// One FIFO shared by every carrier.
    Global,
    /// A bounded FIFO per carrier plus the global injector; idle carriers
    /// steal from their peers.
    PerCarrier,
}

impl QueueDiscipline {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Some(QueueDiscipline::Global),
            "per-carrier" | "per_carrier" | "local" => Some(QueueDiscipline::PerCarrier),
            _ => None,
        }
    }
}

impl fmt::Display for QueueDiscipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueDiscipline::Global => write!(f, "global"),
            QueueDiscipline::PerCarrier => write!(f, "per-carrier"),
        }
    }
}

/// Destination for pin diagnostics.
#[derive(Clone, Default)]
pub enum PinSink {
    /// `tracing::warn!` per pin event.
    #[default]
    Log,
    /// Record only (still visible through `Scheduler::pin_records`).
    Silent,
    /// Hand every event to an observer.
    Observer(Arc<dyn PinObserver>),
}

impl fmt::Debug for PinSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinSink::Log => write!(f, "Log"),
            PinSink::Silent => write!(f, "Silent"),
            PinSink::Observer(_) => write!(f, "Observer(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of carrier threads. 0 means hardware parallelism.
    pub carriers: usize,
    pub discipline: QueueDiscipline,
    /// Per-carrier queue bound before overflow goes global.
    pub local_queue_capacity: usize,
    pub pin_sink: PinSink,
    /// Pin records kept for `pin_records()`; oldest dropped first.
    pub pin_history: usize,
    /// How often a pinned carrier re-checks whether its task un-pinned.
    pub pin_recheck: Duration,
    /// Upper bound on an idle carrier's sleep between queue checks.
    pub idle_park: Duration,
    /// Carrier threads are named `{thread_name}-{id}`.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            carriers: 0,
            discipline: QueueDiscipline::Global,
            local_queue_capacity: 256,
            pin_sink: PinSink::Log,
            pin_history: 1024,
            pin_recheck: Duration::from_millis(2),
            idle_park: Duration::from_millis(5),
            thread_name: "skein-carrier".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by `SKEIN_CARRIERS`, `SKEIN_QUEUE` and
    /// `SKEIN_TRACE_PINNED`. Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = get("SKEIN_CARRIERS") {
            match raw.trim().parse::<usize>() {
                Ok(n) => self.carriers = n,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid SKEIN_CARRIERS"),
            }
        }
        if let Some(raw) = get("SKEIN_QUEUE") {
            match QueueDiscipline::parse(&raw) {
                Some(d) => self.discipline = d,
                None => tracing::warn!(value = %raw, "ignoring invalid SKEIN_QUEUE"),
            }
        }
        if let Some(raw) = get("SKEIN_TRACE_PINNED") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "off" | "none" | "0" | "false" => self.pin_sink = PinSink::Silent,
                "log" | "short" | "full" | "1" | "true" => self.pin_sink = PinSink::Log,
                _ => tracing::warn!(value = %raw, "ignoring invalid SKEIN_TRACE_PINNED"),
            }
        }
    }

    pub fn with_carriers(mut self, n: usize) -> Self {
        self.carriers = n;
        self
    }

    pub fn with_discipline(mut self, discipline: QueueDiscipline) -> Self {
        self.discipline = discipline;
        self
    }

    pub fn with_pin_sink(mut self, sink: PinSink) -> Self {
        self.pin_sink = sink;
        self
    }

    pub fn with_local_queue_capacity(mut self, capacity: usize) -> Self {
        self.local_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Carrier count after resolving 0 to the hardware default.
    pub fn resolved_carriers(&self) -> usize {
        if self.carriers == 0 {
            thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        } else {
            self.carriers
        }
    }
}
