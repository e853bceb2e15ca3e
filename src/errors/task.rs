// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Per-task failure and skip causes
//!
//! These are stored on task run records and in the ledger, so they are plain
//! serializable data rather than diagnostics.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why a task run ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    /// The task body exited non-zero on its last attempt
    Exit { code: i32, attempts: u32 },
    /// The task exceeded its timeout
    TimedOut { millis: u64 },
    /// The runner could not execute the task after infrastructure retries
    Infrastructure { message: String },
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exit { code, attempts } if *attempts > 1 => {
                write!(f, "exited with code {} after {} attempts", code, attempts)
            }
            Self::Exit { code, .. } => write!(f, "exited with code {}", code),
            Self::TimedOut { millis } => {
                write!(f, "timed out after {:?}", Duration::from_millis(*millis))
            }
            Self::Infrastructure { message } => write!(f, "infrastructure error: {}", message),
        }
    }
}

/// Why a task run ended in `Skipped`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// A predecessor failed or was itself skipped
    UpstreamFailed { task: String },
    /// Another task failed and fail-fast stopped new dispatch
    FailFast { task: String },
    /// The run was cancelled
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpstreamFailed { task } => write!(f, "upstream '{}' did not succeed", task),
            Self::FailFast { task } => write!(f, "fail-fast after '{}' failed", task),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
