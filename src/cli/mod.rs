// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! CLI command definitions and handlers
//!
//! Defines the command-line interface for pipeflow.

pub mod graph;
pub mod resume;
pub mod run;
pub mod status;
pub mod validate;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use crate::config::EngineConfig;
use crate::errors::PipeflowError;
use crate::pipeline::PipelineDefinition;
use crate::runners::RunnerKind;

/// Pipeline orchestration engine
///
/// Run DAGs of containerized or shell tasks with retries and resumable history.
#[derive(Parser, Debug)]
#[clap(
    name = "pipeflow",
    version,
    about = "Run task pipelines as dependency graphs with retries, cancellation and resume",
    long_about = None,
    after_help = "Examples:\n\
        pipeflow validate ci.yaml                Check a pipeline definition\n\
        pipeflow run ci.yaml -p repo-url=URL     Run a pipeline\n\
        pipeflow graph ci.yaml -f mermaid        Draw the task graph\n\
        pipeflow status                          List recorded runs\n\
        pipeflow resume <RUN_ID> ci.yaml         Continue an interrupted run\n\n\
        Exit codes: 0 succeeded, 1 failed, 2 invalid definition, 130 cancelled."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Change to directory before executing
    #[clap(short = 'C', long, global = true, value_name = "DIR")]
    pub directory: Option<PathBuf>,

    /// Engine configuration file (default: ./pipeflow.toml, then the user config dir)
    #[clap(long, global = true, env = "PIPEFLOW_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline
    Run {
        /// Pipeline file
        pipeline: PathBuf,

        /// Parameter override
        #[clap(short = 'p', long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Directory of task spec files (overrides specs_dir)
        #[clap(long, value_name = "DIR")]
        specs: Option<PathBuf>,

        /// Maximum tasks running at once
        #[clap(short = 'j', long, env = "PIPEFLOW_CONCURRENCY")]
        concurrency: Option<usize>,

        /// Keep running independent tasks after a failure
        #[clap(long)]
        no_fail_fast: bool,

        /// Task runner (auto, shell, container)
        #[clap(long, env = "PIPEFLOW_RUNNER")]
        runner: Option<RunnerKind>,
    },

    /// Validate a pipeline definition
    Validate {
        /// Pipeline file to validate
        pipeline: PathBuf,

        /// Also check that parameters resolve with these overrides
        #[clap(short = 'p', long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Directory of task spec files (overrides specs_dir)
        #[clap(long, value_name = "DIR")]
        specs: Option<PathBuf>,
    },

    /// Show a pipeline as a graph
    Graph {
        /// Pipeline file
        pipeline: PathBuf,

        /// Output format
        #[clap(short, long, value_enum, default_value_t = GraphFormat::Text)]
        format: GraphFormat,
    },

    /// Show recorded runs, or one run in detail
    Status {
        /// Run to show (default: list all runs)
        run_id: Option<String>,

        /// Output format
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Continue a run that was interrupted, failed or cancelled
    Resume {
        /// Run to continue
        run_id: String,

        /// Pipeline file the run was started from
        pipeline: PathBuf,

        /// Directory of task spec files (overrides specs_dir)
        #[clap(long, value_name = "DIR")]
        specs: Option<PathBuf>,
    },
}

/// Output format for the status command
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Graph output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GraphFormat {
    Text,
    Dot,
    Mermaid,
}

/// Load a pipeline file, with a hint when it is missing
pub(crate) fn load_pipeline(path: &Path) -> Result<PipelineDefinition, PipeflowError> {
    if !path.exists() {
        return Err(PipeflowError::FileReadError {
            path: path.to_path_buf(),
            error: "no such file".to_string(),
        });
    }
    PipelineDefinition::from_file(path)
}

/// Load engine configuration and apply a `--specs` override
pub(crate) fn load_config(path: Option<&Path>, specs: Option<PathBuf>) -> Result<EngineConfig, PipeflowError> {
    let mut config = EngineConfig::load(path)?;
    if let Some(dir) = specs {
        config.specs_dir = dir;
    }
    Ok(config)
}
