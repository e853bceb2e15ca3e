// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! pipeflow - pipeline orchestration engine
//!
//! Exit codes: 0 when the run succeeded, 1 when it failed, 2 for an invalid
//! definition and 130 when it was cancelled.

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipeflow::cli::{Cli, Commands};
use pipeflow::PipeflowError;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr so graph and status output can be piped
    let default_filter = if cli.verbose { "pipeflow=debug" } else { "pipeflow=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
    pipeflow::utils::init_colors();

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            let code = report
                .downcast_ref::<PipeflowError>()
                .map(|e| e.category().exit_code())
                .unwrap_or(1);
            eprintln!("{:?}", report);
            ExitCode::from(code)
        }
    }
}

async fn dispatch(cli: Cli) -> miette::Result<()> {
    // Change to specified directory if provided
    if let Some(ref dir) = cli.directory {
        std::env::set_current_dir(dir).map_err(|e| {
            miette::miette!("Failed to change to directory '{}': {}", dir.display(), e)
        })?;
    }

    let config = cli.config;
    match cli.command {
        Commands::Run {
            pipeline,
            params,
            specs,
            concurrency,
            no_fail_fast,
            runner,
        } => {
            pipeflow::cli::run::run(
                pipeline,
                params,
                specs,
                concurrency,
                no_fail_fast,
                runner,
                config,
                cli.verbose,
            )
            .await
        }
        Commands::Validate {
            pipeline,
            params,
            specs,
        } => pipeflow::cli::validate::run(pipeline, params, specs, config, cli.verbose).await,
        Commands::Graph { pipeline, format } => {
            pipeflow::cli::graph::run(pipeline, format, cli.verbose).await
        }
        Commands::Status { run_id, format } => {
            pipeflow::cli::status::run(run_id, format, config, cli.verbose).await
        }
        Commands::Resume {
            run_id,
            pipeline,
            specs,
        } => pipeflow::cli::resume::run(run_id, pipeline, specs, config, cli.verbose).await,
    }
}
