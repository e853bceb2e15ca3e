// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Runs and task run records
//!
//! A [`Run`] is one execution of a pipeline. It owns one [`TaskRunRecord`]
//! per task, indexed like the DAG, and is handed to the scheduler by
//! reference; nothing about a run lives in process-wide state.

mod cancel;
mod record;

pub use cancel::{CancelHandle, CancelSignal};
pub use record::{TaskRunRecord, TaskStatus};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::PipeflowError;

/// Unique run identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = PipeflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| PipeflowError::RunNotFound {
                run_id: s.to_string(),
            })
    }
}

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One execution of a pipeline
#[derive(Debug, Clone)]
pub struct Run {
    pub id: RunId,
    pub pipeline: String,
    pub params: BTreeMap<String, String>,
    /// Indexed like the pipeline's DAG
    pub records: Vec<TaskRunRecord>,
    pub cancelled: bool,
}

impl Run {
    /// A fresh run with every task `Pending`
    pub fn new(pipeline: &str, params: BTreeMap<String, String>, tasks: &[&str]) -> Self {
        Self {
            id: RunId::new(),
            pipeline: pipeline.to_string(),
            params,
            records: tasks.iter().map(|t| TaskRunRecord::new(t)).collect(),
            cancelled: false,
        }
    }

    /// A run with a known id, used when rebuilding from the ledger
    pub fn with_id(id: RunId, pipeline: &str, params: BTreeMap<String, String>, tasks: &[&str]) -> Self {
        Self {
            id,
            ..Self::new(pipeline, params, tasks)
        }
    }

    pub fn record(&self, name: &str) -> Option<&TaskRunRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    /// Whether every record reached a terminal state
    pub fn is_settled(&self) -> bool {
        self.records.iter().all(|r| r.status.is_terminal())
    }

    /// Aggregate status: cancelled wins, then any failure or skip, else success
    pub fn status(&self) -> RunStatus {
        if self.cancelled {
            return RunStatus::Cancelled;
        }
        if !self.is_settled() {
            return RunStatus::Running;
        }
        let all_succeeded = self
            .records
            .iter()
            .all(|r| r.status == TaskStatus::Succeeded);
        if all_succeeded {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        }
    }

    /// Task names by status, for summaries
    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.name.as_str())
            .collect()
    }
}
