// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Task run records and their state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{PipeflowError, SkipReason, TaskError};

/// Status of one task within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Allowed edges of the state machine
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Skipped)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Execution record of one task within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunRecord {
    pub name: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Where the captured output of the last attempt lives
    #[serde(default)]
    pub log_ref: Option<String>,
    #[serde(default)]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub skip_reason: Option<SkipReason>,
}

impl TaskRunRecord {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: TaskStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            exit_code: None,
            log_ref: None,
            error: None,
            skip_reason: None,
        }
    }

    /// Move to `to`, stamping start/finish times; terminal records never change
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), PipeflowError> {
        if !self.status.can_transition_to(to) {
            return Err(PipeflowError::InvalidTransition {
                task: self.name.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        if to == TaskStatus::Running {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = to;
        Ok(())
    }

    /// Mark skipped with a reason
    pub fn skip(&mut self, reason: SkipReason) -> Result<(), PipeflowError> {
        self.transition(TaskStatus::Skipped)?;
        self.skip_reason = Some(reason);
        Ok(())
    }

    /// Mark failed with the error that caused it
    pub fn fail(&mut self, error: TaskError, exit_code: Option<i32>) -> Result<(), PipeflowError> {
        self.transition(TaskStatus::Failed)?;
        self.exit_code = exit_code;
        self.error = Some(error);
        Ok(())
    }

    /// Wall time between start and finish
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}
