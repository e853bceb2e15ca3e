// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Resume command - continue a recorded run

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;

use crate::run::RunId;

use super::run::{follow, open_engine, print_report};

/// Continue a run from its ledger
///
/// Tasks that already succeeded keep their results; interrupted and
/// cancelled ones run again.
pub async fn run(
    run_id: String,
    pipeline_path: PathBuf,
    specs: Option<PathBuf>,
    config_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let run_id: RunId = run_id.parse()?;
    let config = super::load_config(config_path.as_deref(), specs)?;
    let (engine, _) = open_engine(&pipeline_path, config, verbose)?;
    engine.check_runner().await?;

    let snapshot = engine.status(run_id).await?;
    engine.resume(run_id).await?;
    println!(
        "{} {} {}",
        "Resuming".bold(),
        snapshot.pipeline.cyan(),
        format!("(run {}, was {})", run_id, snapshot.status).dimmed()
    );

    let report = follow(&engine, run_id, &snapshot.pipeline, verbose).await?;
    print_report(&engine, &report).await;
    report.into_result()?;
    Ok(())
}
