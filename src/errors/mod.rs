// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Error types
//!
//! Every failure the engine can report is a [`PipeflowError`]. Variants are
//! grouped into categories (validation, task execution, infrastructure,
//! cancellation) which decide retry behaviour and CLI exit codes.

mod task;

pub use task::{SkipReason, TaskError};

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for pipeflow operations
pub type PipeflowResult<T> = Result<T, PipeflowError>;

/// Main error type for pipeflow
#[derive(Error, Debug, Diagnostic)]
pub enum PipeflowError {
    // ─────────────────────────────────────────────────────────────────────────
    // Validation Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Cyclic dependency: {}", .cycle.join(" → "))]
    #[diagnostic(
        code(pipeflow::cyclic_dependency),
        help("Review the run_after lists of the tasks in the cycle")
    )]
    CyclicDependency { cycle: Vec<String> },

    #[error("Task '{task}' runs after unknown task '{reference}'")]
    #[diagnostic(
        code(pipeflow::unknown_task_reference),
        help("Check that '{reference}' is defined in the pipeline's tasks")
    )]
    UnknownTaskReference { task: String, reference: String },

    #[error("Task '{task}' is defined more than once")]
    #[diagnostic(code(pipeflow::duplicate_task))]
    DuplicateTask { task: String },

    #[error("Missing required parameter '{param}'")]
    #[diagnostic(
        code(pipeflow::missing_required_parameter),
        help("Pass it with '-p {param}=<value>' or give it a default")
    )]
    MissingRequiredParameter { param: String },

    #[error("Unresolved reference '$({reference})' in {location}")]
    #[diagnostic(code(pipeflow::unresolved_reference))]
    UnresolvedReference { reference: String, location: String },

    #[error("Task '{task}' references unknown task spec '{spec}'")]
    #[diagnostic(
        code(pipeflow::unknown_task_spec),
        help("Declare '{spec}' under 'specs' or load it with --specs")
    )]
    UnknownTaskSpec { task: String, spec: String },

    #[error("Task '{task}' binds unknown workspace '{workspace}'")]
    #[diagnostic(code(pipeflow::unknown_workspace))]
    UnknownWorkspace { task: String, workspace: String },

    #[error("Task '{task}' does not bind workspace role '{role}'")]
    #[diagnostic(code(pipeflow::missing_workspace_binding))]
    MissingWorkspaceBinding { task: String, role: String },

    #[error("Invalid pipeline configuration: {reason}")]
    #[diagnostic(code(pipeflow::invalid_pipeline))]
    InvalidPipeline {
        reason: String,
        #[help]
        help: Option<String>,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Task '{task}' failed: {error}")]
    #[diagnostic(code(pipeflow::task_failed))]
    TaskFailed { task: String, error: TaskError },

    #[error("Invalid transition for task '{task}': {from} → {to}")]
    #[diagnostic(code(pipeflow::invalid_transition))]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("Run {run_id} was cancelled")]
    #[diagnostic(code(pipeflow::cancelled))]
    Cancelled { run_id: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Infrastructure Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Workspace '{workspace}' unavailable at {path}: {error}")]
    #[diagnostic(code(pipeflow::workspace_unavailable))]
    WorkspaceUnavailable {
        workspace: String,
        path: PathBuf,
        error: String,
    },

    #[error("Runner '{runner}' unavailable: {error}")]
    #[diagnostic(
        code(pipeflow::runner_unavailable),
        help("Install docker or podman, or set runner = \"shell\" in pipeflow.toml")
    )]
    RunnerUnavailable { runner: String, error: String },

    #[error("Ledger error: {message}")]
    #[diagnostic(code(pipeflow::ledger_error))]
    Ledger { message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Lookup Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Pipeline '{name}' is not registered")]
    #[diagnostic(code(pipeflow::pipeline_not_found))]
    PipelineNotFound { name: String },

    #[error("Run {run_id} not found")]
    #[diagnostic(code(pipeflow::run_not_found))]
    RunNotFound { run_id: String },

    // ─────────────────────────────────────────────────────────────────────────
    // IO/System Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to read file '{path}': {error}")]
    #[diagnostic(code(pipeflow::file_read_error))]
    FileReadError { path: PathBuf, error: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(pipeflow::io_error))]
    Io { message: String },

    #[error("YAML parsing error: {message}")]
    #[diagnostic(code(pipeflow::yaml_error))]
    Yaml { message: String },

    #[error("JSON parsing error: {message}")]
    #[diagnostic(code(pipeflow::json_error))]
    Json { message: String },

    #[error("TOML parsing error: {message}")]
    #[diagnostic(code(pipeflow::toml_error))]
    Toml { message: String },
}

impl From<std::io::Error> for PipeflowError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for PipeflowError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml { message: e.to_string() }
    }
}

impl From<serde_json::Error> for PipeflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json { message: e.to_string() }
    }
}

impl From<toml::de::Error> for PipeflowError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml { message: e.to_string() }
    }
}

/// Broad error classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Definition problems caught before anything runs
    Validation,
    /// A task exited non-zero or timed out
    TaskExecution,
    /// Workspace, runner or ledger trouble; retried with backoff
    Infrastructure,
    /// The run was cancelled
    Cancellation,
    /// Everything else (IO, parsing of unrelated files, lookups)
    Internal,
}

impl ErrorCategory {
    /// Process exit code used by the CLI for this category
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Validation => 2,
            Self::Cancellation => 130,
            Self::TaskExecution | Self::Infrastructure | Self::Internal => 1,
        }
    }
}

impl PipeflowError {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::CyclicDependency { .. }
            | Self::UnknownTaskReference { .. }
            | Self::DuplicateTask { .. }
            | Self::MissingRequiredParameter { .. }
            | Self::UnresolvedReference { .. }
            | Self::UnknownTaskSpec { .. }
            | Self::UnknownWorkspace { .. }
            | Self::MissingWorkspaceBinding { .. }
            | Self::InvalidPipeline { .. }
            | Self::Yaml { .. } => ErrorCategory::Validation,
            Self::TaskFailed { .. } => ErrorCategory::TaskExecution,
            Self::WorkspaceUnavailable { .. }
            | Self::RunnerUnavailable { .. }
            | Self::Ledger { .. } => ErrorCategory::Infrastructure,
            Self::Cancelled { .. } => ErrorCategory::Cancellation,
            Self::InvalidTransition { .. }
            | Self::PipelineNotFound { .. }
            | Self::RunNotFound { .. }
            | Self::FileReadError { .. }
            | Self::Io { .. }
            | Self::Json { .. }
            | Self::Toml { .. } => ErrorCategory::Internal,
        }
    }

    /// Whether this error rejects a definition before it runs
    pub fn is_validation(&self) -> bool {
        self.category() == ErrorCategory::Validation
    }

    /// Whether a retry with backoff may clear this error
    pub fn is_infrastructure(&self) -> bool {
        self.category() == ErrorCategory::Infrastructure || matches!(self, Self::Io { .. })
    }

    pub(crate) fn invalid_pipeline(reason: impl Into<String>) -> Self {
        Self::InvalidPipeline {
            reason: reason.into(),
            help: None,
        }
    }

    pub(crate) fn ledger(message: impl std::fmt::Display) -> Self {
        Self::Ledger {
            message: message.to_string(),
        }
    }
}
