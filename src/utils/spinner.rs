// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Live progress for a running pipeline

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::ledger::RunSnapshot;
use crate::run::TaskStatus;

/// Create a spinner for indeterminate progress
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
        .template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Spinner that follows a run through its snapshots
///
/// Hidden when stderr is not a terminal or verbose logging is on, so log
/// lines and redirected output stay clean.
pub struct RunProgress {
    bar: Option<ProgressBar>,
}

impl RunProgress {
    pub fn new(pipeline: &str, visible: bool) -> Self {
        let visible = visible && console::Term::stderr().features().is_attended();
        Self {
            bar: visible.then(|| create_spinner(&format!("Running {}", pipeline))),
        }
    }

    pub fn is_visible(&self) -> bool {
        self.bar.is_some()
    }

    pub fn update(&self, snapshot: &RunSnapshot) {
        if let Some(bar) = &self.bar {
            bar.set_message(progress_message(snapshot));
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

/// `[done/total] running: a, b`
pub fn progress_message(snapshot: &RunSnapshot) -> String {
    let done = snapshot.tasks.iter().filter(|t| t.status.is_terminal()).count();
    let running: Vec<&str> = snapshot
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Running)
        .map(|t| t.name.as_str())
        .collect();

    let mut message = format!("[{}/{}]", done, snapshot.tasks.len());
    if running.is_empty() {
        message.push_str(" waiting");
    } else {
        message.push_str(&format!(" running: {}", running.join(", ")));
    }
    message
}
