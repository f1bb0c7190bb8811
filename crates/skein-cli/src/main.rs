// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Skein CLI - runs scheduling demos on a skein scheduler and reports
//! what the carriers did.

mod demos;
mod output;

use std::process;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use skein_rt::{PinSink, QueueDiscipline, SchedulerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "skein", version, about = "Lightweight tasks over a pool of carrier threads")]
struct Cli {
    /// Carrier threads (default: SKEIN_CARRIERS, else hardware parallelism)
    #[arg(long, global = true)]
    carriers: Option<usize>,

    /// Run queue discipline (default: SKEIN_QUEUE, else global)
    #[arg(long, global = true, value_enum)]
    queue: Option<QueueArg>,

    /// Log every pin event as it happens
    #[arg(long, global = true)]
    trace_pinned: bool,

    /// Print the report as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Raise log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    demo: Demo,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum QueueArg {
    Global,
    PerCarrier,
}

impl From<QueueArg> for QueueDiscipline {
    fn from(arg: QueueArg) -> Self {
        match arg {
            QueueArg::Global => QueueDiscipline::Global,
            QueueArg::PerCarrier => QueueDiscipline::PerCarrier,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Demo {
    /// Three tasks share one carrier; two of them yield every other step
    Cooperative {
        #[arg(long, default_value_t = 6)]
        steps: usize,
    },
    /// Many sleeping tasks finish in about one sleep
    Io {
        #[arg(long, default_value_t = 100)]
        tasks: usize,
        #[arg(long, default_value_t = 200)]
        sleep_ms: u64,
    },
    /// Sleeping inside a native monitor pins carriers
    Pinning {
        #[arg(long, default_value_t = 8)]
        tasks: usize,
        #[arg(long, default_value_t = 50)]
        sleep_ms: u64,
        /// Use a skein lock instead of the native monitor
        #[arg(long)]
        fix: bool,
    },
    /// A fair lock hands ownership over in arrival order
    Locks {
        #[arg(long, default_value_t = 8)]
        tasks: usize,
        #[arg(long, default_value_t = 10)]
        hold_ms: u64,
    },
    /// Lost updates without a lock, an exact count with one
    Race {
        #[arg(long, default_value_t = 20)]
        tasks: usize,
        #[arg(long, default_value_t = 50)]
        adds: usize,
    },
    /// CPU-bound tasks released together by a latch
    Cpu {
        /// Default: three per carrier
        #[arg(long)]
        tasks: Option<usize>,
        #[arg(long, default_value_t = 27)]
        n: u32,
    },
    /// Named tasks from a factory, each spawning and joining children
    Factory {
        #[arg(long, default_value_t = 3)]
        parents: usize,
        #[arg(long, default_value_t = 2)]
        children: usize,
    },
    /// Tasks fail deep in a call chain; the failures come back aggregated
    Failures {
        #[arg(long, default_value_t = 10)]
        tasks: usize,
        #[arg(long, default_value_t = 4)]
        fail_every: usize,
    },
}

fn main() {
    let cli = Cli::parse();
    output::init();
    init_tracing(cli.verbose);

    let config = build_config(&cli);
    match demos::run(&cli.demo, config) {
        Ok(report) => {
            if cli.json {
                let json = serde_json::to_string_pretty(&report)
                    .unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e));
                println!("{}", json);
            } else {
                output::print_report(&report);
            }
        }
        Err(e) => {
            eprintln!("{}: {}", output::error_label(), e);
            process::exit(1);
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info,skein_rt=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Environment first, flags on top. Pins are only logged live when asked
/// for; the report lists them either way.
fn build_config(cli: &Cli) -> SchedulerConfig {
    let mut config = SchedulerConfig::from_env();
    if let Some(n) = cli.carriers {
        config = config.with_carriers(n);
    }
    if let Some(queue) = cli.queue {
        config = config.with_discipline(queue.into());
    }
    if cli.trace_pinned {
        config = config.with_pin_sink(PinSink::Log);
    } else if std::env::var_os("SKEIN_TRACE_PINNED").is_none() {
        config = config.with_pin_sink(PinSink::Silent);
    }
    config
}
