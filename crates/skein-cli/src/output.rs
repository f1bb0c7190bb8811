// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! CLI output formatting with colors and styling.
//!
//! Respects NO_COLOR and FORCE_COLOR environment variables.
//! Colors are automatically disabled when output is piped.

use colored::{ColoredString, Colorize};

use crate::demos::Report;

/// Initialize color support based on environment.
/// Call once at startup.
pub fn init() {
    // colored handles NO_COLOR itself; FORCE_COLOR is ours
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    } else if std::env::var("FORCE_COLOR").is_ok() {
        colored::control::set_override(true);
    }
}

// === Labels ===

pub fn error_label() -> ColoredString {
    "error".red().bold()
}

pub fn banner_ok(phase: &str) -> String {
    format!(
        "{} {} {}",
        "===".dimmed(),
        format!("{} OK", phase).green().bold(),
        "===".dimmed()
    )
}

pub fn banner_failures(phase: &str, count: usize) -> String {
    let msg = if count == 1 {
        format!("{} finished: 1 task failed", phase)
    } else {
        format!("{} finished: {} tasks failed", phase, count)
    };
    format!("{} {} {}", "===".dimmed(), msg.yellow().bold(), "===".dimmed())
}

pub fn section_header(header: &str) -> ColoredString {
    header.yellow().bold()
}

pub fn separator(width: usize) -> ColoredString {
    "─".repeat(width).dimmed()
}

fn key(name: &str) -> ColoredString {
    name.cyan()
}

fn bullet() -> ColoredString {
    "•".dimmed()
}

fn pin_mark() -> ColoredString {
    "📌".normal()
}

fn fail_mark() -> ColoredString {
    "✗".red()
}

// === Report ===

pub fn print_report(report: &Report) {
    if report.failures.is_empty() {
        println!("{}", banner_ok(report.demo));
    } else {
        println!("{}", banner_failures(report.demo, report.failures.len()));
    }
    println!(
        "  {} {}  {} {}  {} {} ms",
        key("carriers"),
        report.carriers,
        key("queue"),
        report.discipline,
        key("elapsed"),
        report.elapsed_ms
    );

    if !report.lines.is_empty() {
        println!();
        for line in &report.lines {
            println!("  {} {}", bullet(), line);
        }
    }

    if !report.pins.is_empty() {
        println!();
        println!("{}", section_header("Pinned carriers:"));
        for pin in &report.pins {
            let held = match pin.blocked_ms {
                Some(ms) => format!("{} ms", ms),
                None => "still pinned".to_string(),
            };
            println!(
                "  {} {} on {} blocked on {} ({})",
                pin_mark(),
                pin.task_label(),
                pin.carrier,
                pin.blocker,
                held.dimmed()
            );
        }
    }

    if !report.failures.is_empty() {
        println!();
        println!("{}", section_header("Failures:"));
        for failure in &report.failures {
            println!("  {} {}", fail_mark(), failure);
        }
    }

    let s = &report.stats;
    println!();
    println!("{}", separator(48));
    println!(
        "  submitted {}  completed {}  failed {}",
        s.submitted, s.completed, s.failed
    );
    println!(
        "  mounts {}  yields {}  parks {}  pins {}  steals {}",
        s.mounts, s.yields, s.parks, s.pins, s.steals
    );
}
