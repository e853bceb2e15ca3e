// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Run command - execute a pipeline

use colored::Colorize;
use miette::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::engine::{Engine, RunReport};
use crate::errors::PipeflowError;
use crate::pipeline::ParameterResolver;
use crate::run::{RunId, TaskStatus};
use crate::runners::RunnerKind;
use crate::utils::{print_task, print_warning, run_status, RunProgress};

/// Lines of captured output shown for a failed task
const LOG_TAIL: usize = 20;

/// Run a pipeline
#[allow(clippy::too_many_arguments)]
pub async fn run(
    pipeline_path: PathBuf,
    params: Vec<String>,
    specs: Option<PathBuf>,
    concurrency: Option<usize>,
    no_fail_fast: bool,
    runner: Option<RunnerKind>,
    config_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let mut config = super::load_config(config_path.as_deref(), specs)?;
    if let Some(limit) = concurrency {
        if limit == 0 {
            return Err(PipeflowError::invalid_pipeline("concurrency must be at least 1").into());
        }
        config.concurrency = limit;
    }
    if no_fail_fast {
        config.fail_fast = false;
    }
    if let Some(kind) = runner {
        config.runner = kind;
    }

    let overrides = ParameterResolver::parse_overrides(&params)?;
    let (engine, name) = open_engine(&pipeline_path, config, verbose)?;
    engine.check_runner().await?;

    let run_id = engine.trigger(&name, &overrides).await?;
    println!(
        "{} {} {}",
        "Running".bold(),
        name.cyan(),
        format!("(run {})", run_id).dimmed()
    );

    let report = follow(&engine, run_id, &name, verbose).await?;
    print_report(&engine, &report).await;
    report.into_result()?;
    Ok(())
}

/// Build an engine from config and register the pipeline file with it
///
/// Returns the engine and the registered pipeline's name.
pub(crate) fn open_engine(
    pipeline_path: &Path,
    config: EngineConfig,
    verbose: bool,
) -> std::result::Result<(Engine, String), PipeflowError> {
    let pipeline = super::load_pipeline(pipeline_path)?;
    let name = pipeline.name.clone();
    let mut engine = Engine::from_config(config)?;
    let warnings = engine.register_pipeline(pipeline)?;

    if verbose {
        for warning in &warnings {
            print_warning(warning);
        }
    }
    Ok((engine, name))
}

/// Wait for a run while keeping the spinner current; Ctrl-C cancels it
pub(crate) async fn follow(
    engine: &Engine,
    run_id: RunId,
    pipeline: &str,
    verbose: bool,
) -> std::result::Result<RunReport, PipeflowError> {
    let progress = RunProgress::new(pipeline, !verbose);

    let wait = engine.wait(run_id);
    tokio::pin!(wait);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let mut interrupted = false;

    let report = loop {
        tokio::select! {
            report = &mut wait => break report,
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if signal.is_ok() {
                    progress.finish();
                    eprintln!("{}", "Cancelling; running tasks get a moment to stop".yellow());
                    engine.cancel(run_id)?;
                }
            }
            _ = ticker.tick(), if progress.is_visible() => {
                if let Ok(snapshot) = engine.status(run_id).await {
                    progress.update(&snapshot);
                }
            }
        }
    };

    progress.finish();
    report
}

/// Per-task summary, plus the tail of each failed task's output
pub(crate) async fn print_report(engine: &Engine, report: &RunReport) {
    let width = report.tasks.iter().map(|t| t.name.len()).max().unwrap_or(0);

    println!();
    for record in &report.tasks {
        print_task(record, width);
    }

    for record in report.tasks.iter().filter(|t| t.status == TaskStatus::Failed) {
        let Some(log_ref) = &record.log_ref else {
            continue;
        };
        let Ok(text) = engine.ledger().read_log(log_ref).await else {
            continue;
        };
        let lines: Vec<&str> = text.lines().collect();
        if lines.is_empty() {
            continue;
        }

        eprintln!();
        eprintln!("{}", format!("Output of '{}':", record.name).red().bold());
        for line in &lines[lines.len().saturating_sub(LOG_TAIL)..] {
            eprintln!("  {}", line.dimmed());
        }
    }

    println!();
    println!(
        "Run {} {}",
        report.run_id.to_string().dimmed(),
        run_status(report.status)
    );
}
