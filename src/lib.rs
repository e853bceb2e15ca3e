// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! # pipeflow - Pipeline Orchestration Engine
//!
//! `pipeflow` runs pipelines: named DAGs of tasks, each an instance of a
//! reusable task spec, executed in containers or a local shell.
//!
//! ## Features
//!
//! - **Dependency graph** - `run_after` edges, cycle detection, bounded parallelism
//! - **Parameters** - `$(params.name)` references resolved before anything runs
//! - **Workspaces** - per-run directories shared between tasks
//! - **Failure handling** - retries with backoff, timeouts, fail-fast, cancellation
//! - **Run ledger** - append-only history used for status queries and resume
//!
//! ## Quick Start
//!
//! ```bash
//! # Check a definition
//! pipeflow validate ci.yaml
//!
//! # Run it with a parameter
//! pipeflow run ci.yaml -p repo-url=https://example.com/repo.git
//!
//! # Continue an interrupted run
//! pipeflow resume <RUN_ID> ci.yaml
//! ```

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod ledger;
pub mod pipeline;
pub mod registry;
pub mod run;
pub mod runners;
pub mod scheduler;
pub mod utils;
pub mod workspace;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{Engine, RunReport};
pub use errors::{ErrorCategory, PipeflowError, PipeflowResult};
pub use pipeline::{PipelineDefinition, TaskNode};
pub use registry::{TaskRegistry, TaskSpec};
pub use run::{RunId, RunStatus, TaskStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
