// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Status command - query the run ledger

use colored::Colorize;
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;

use crate::ledger::{FileLedger, Ledger, RunSnapshot};
use crate::run::RunId;
use crate::utils::{print_task, run_status};

use super::OutputFormat;

/// Show one run, or list every recorded run
pub async fn run(
    run_id: Option<String>,
    format: OutputFormat,
    config_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let config = super::load_config(config_path.as_deref(), None)?;
    let ledger = FileLedger::new(&config.ledger_dir)?;

    match run_id {
        Some(id) => {
            let snapshot = ledger.snapshot(id.parse::<RunId>()?).await?;
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&snapshot).into_diagnostic()?)
                }
                OutputFormat::Text => print_snapshot(&snapshot, verbose),
            }
        }
        None => {
            let mut snapshots = Vec::new();
            for id in ledger.runs().await? {
                match ledger.snapshot(id).await {
                    Ok(snapshot) => snapshots.push(snapshot),
                    Err(e) => tracing::warn!("Skipping run {}: {}", id, e),
                }
            }
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&snapshots).into_diagnostic()?)
                }
                OutputFormat::Text => print_runs(&snapshots),
            }
        }
    }

    Ok(())
}

fn print_snapshot(snapshot: &RunSnapshot, verbose: bool) {
    println!("{} {}", "Run".bold(), snapshot.run_id);
    println!("  Pipeline: {}", snapshot.pipeline.cyan());
    println!("  Status:   {}", run_status(snapshot.status));
    println!("  Started:  {}", snapshot.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(finished) = snapshot.finished_at {
        println!("  Finished: {}", finished.format("%Y-%m-%d %H:%M:%S UTC"));
    } else if snapshot.status.is_terminal() {
        println!("  Finished: {}", "unknown".dimmed());
    } else {
        println!("  Finished: {}", "not recorded; resume to continue".yellow());
    }
    if snapshot.cancel_requested {
        println!("  {}", "Cancellation was requested".yellow());
    }

    if verbose && !snapshot.params.is_empty() {
        println!();
        println!("{}:", "Parameters".bold());
        for (name, value) in &snapshot.params {
            println!("  {} = {}", name, value);
        }
    }

    println!();
    println!("{}:", "Tasks".bold());
    let width = snapshot.tasks.iter().map(|t| t.name.len()).max().unwrap_or(0);
    for record in &snapshot.tasks {
        print_task(record, width);
    }
}

fn print_runs(snapshots: &[RunSnapshot]) {
    if snapshots.is_empty() {
        println!("{}", "No runs recorded".dimmed());
        return;
    }

    for snapshot in snapshots {
        let done = snapshot.tasks.iter().filter(|t| t.status.is_terminal()).count();
        println!(
            "{}  {}  {:<10} {:<20} {}",
            snapshot.run_id.to_string().dimmed(),
            snapshot.started_at.format("%Y-%m-%d %H:%M:%S"),
            run_status(snapshot.status),
            snapshot.pipeline,
            format!("{}/{} tasks", done, snapshot.tasks.len()).dimmed()
        );
    }
}
