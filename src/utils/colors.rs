// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Terminal styling for run and task status

use colored::{ColoredString, Colorize};

use crate::run::{RunStatus, TaskRunRecord, TaskStatus};

/// Decide once whether output is colored
///
/// Honors `NO_COLOR` and turns colors off when stdout is not a terminal.
pub fn init_colors() {
    if !should_use_colors() {
        colored::control::set_override(false);
    }
}

pub fn should_use_colors() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    console::Term::stdout().features().is_attended()
}

/// One-character marker for a task status
pub fn status_symbol(status: TaskStatus) -> ColoredString {
    match status {
        TaskStatus::Succeeded => "✓".green(),
        TaskStatus::Failed => "✗".red(),
        TaskStatus::Skipped => "○".dimmed(),
        TaskStatus::Running => "▶".blue(),
        TaskStatus::Pending | TaskStatus::Ready => "·".dimmed(),
    }
}

pub fn run_status(status: RunStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        RunStatus::Succeeded => text.green().bold(),
        RunStatus::Failed => text.red().bold(),
        RunStatus::Cancelled => text.yellow().bold(),
        RunStatus::Running => text.blue().bold(),
    }
}

/// Human duration such as `850ms`, `12.3s` or `4m05s`
pub fn format_duration(duration: chrono::Duration) -> String {
    let millis = duration.num_milliseconds().max(0);
    if millis < 1_000 {
        format!("{}ms", millis)
    } else if millis < 60_000 {
        format!("{:.1}s", millis as f64 / 1_000.0)
    } else {
        let secs = millis / 1_000;
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

/// Print one task line: marker, name, then timing or the reason it did not succeed
pub fn print_task(record: &TaskRunRecord, width: usize) {
    let mut detail = Vec::new();
    if let Some(duration) = record.duration() {
        detail.push(format_duration(duration));
    }
    if record.attempts > 1 {
        detail.push(format!("{} attempts", record.attempts));
    }

    let mut line = format!(
        "  {} {:<width$}",
        status_symbol(record.status),
        record.name,
        width = width
    );
    if !detail.is_empty() {
        line.push_str(&format!(" {}", detail.join(", ").dimmed()));
    }
    if let Some(error) = &record.error {
        line.push_str(&format!(" {}", error.to_string().red()));
    }
    if let Some(reason) = &record.skip_reason {
        line.push_str(&format!(" {}", format!("({})", reason).dimmed()));
    }
    println!("{}", line);
}

pub fn print_warning(msg: &str) {
    eprintln!("  {} {}", "⚠".yellow(), msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::milliseconds(850)), "850ms");
        assert_eq!(format_duration(chrono::Duration::milliseconds(12_340)), "12.3s");
        assert_eq!(format_duration(chrono::Duration::seconds(245)), "4m05s");
        assert_eq!(format_duration(chrono::Duration::milliseconds(-5)), "0ms");
    }
}
