// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Run ledger
//!
//! Append-only history of every run: when it started, every task status
//! transition, and how it finished. Status queries and resumption are both
//! answered by replaying a run's entries into a [`RunSnapshot`].

mod filesystem;
mod memory;

pub use filesystem::FileLedger;
pub use memory::MemoryLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{PipeflowError, SkipReason, TaskError};
use crate::run::{Run, RunId, RunStatus, TaskRunRecord, TaskStatus};

/// One ledger line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub run_id: RunId,
    /// Position within the run, from 0
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LedgerEvent,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    RunStarted {
        pipeline: String,
        params: BTreeMap<String, String>,
        /// Task names in declaration order
        tasks: Vec<String>,
    },
    TaskTransition {
        task: String,
        status: TaskStatus,
        #[serde(default)]
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<TaskError>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip_reason: Option<SkipReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_ref: Option<String>,
    },
    TaskRetrying {
        task: String,
        /// The attempt that just failed
        attempt: u32,
        reason: String,
    },
    CancelRequested,
    RunResumed,
    RunFinished {
        status: RunStatus,
    },
}

impl LedgerEvent {
    /// Transition event carrying the record's current state
    pub fn transition(record: &TaskRunRecord) -> Self {
        Self::TaskTransition {
            task: record.name.clone(),
            status: record.status,
            attempt: record.attempts,
            exit_code: record.exit_code,
            error: record.error.clone(),
            skip_reason: record.skip_reason.clone(),
            log_ref: record.log_ref.clone(),
        }
    }
}

/// Trait for ledger storage
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Append an event, assigning the next sequence number of the run
    async fn append(&self, run_id: RunId, event: LedgerEvent) -> Result<LedgerEntry, PipeflowError>;

    /// Every entry of a run in sequence order
    async fn entries(&self, run_id: RunId) -> Result<Vec<LedgerEntry>, PipeflowError>;

    /// Known runs, oldest first
    async fn runs(&self) -> Result<Vec<RunId>, PipeflowError>;

    /// Keep the captured output of one attempt; returns a reference to it
    async fn store_log(
        &self,
        run_id: RunId,
        task: &str,
        attempt: u32,
        text: &str,
    ) -> Result<String, PipeflowError>;

    /// Read back output stored by [`Ledger::store_log`]
    async fn read_log(&self, log_ref: &str) -> Result<String, PipeflowError>;

    /// Status snapshot of a run
    async fn snapshot(&self, run_id: RunId) -> Result<RunSnapshot, PipeflowError> {
        RunSnapshot::replay(&self.entries(run_id).await?)
    }
}

/// Per-task and overall status of a run, rebuilt from its entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub pipeline: String,
    pub params: BTreeMap<String, String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub tasks: Vec<TaskRunRecord>,
}

impl RunSnapshot {
    /// Fold entries into a snapshot; the first entry must start the run
    pub fn replay(entries: &[LedgerEntry]) -> Result<Self, PipeflowError> {
        let (first, rest) = entries
            .split_first()
            .ok_or_else(|| PipeflowError::ledger("run has no entries"))?;

        let mut snapshot = match first.event {
            LedgerEvent::RunStarted {
                ref pipeline,
                ref params,
                ref tasks,
            } => Self {
                run_id: first.run_id,
                pipeline: pipeline.clone(),
                params: params.clone(),
                status: RunStatus::Running,
                started_at: first.at,
                finished_at: None,
                cancel_requested: false,
                tasks: tasks.iter().map(|t| TaskRunRecord::new(t)).collect(),
            },
            _ => {
                return Err(PipeflowError::ledger(format!(
                    "run {} does not begin with run_started",
                    first.run_id
                )))
            }
        };

        for entry in rest {
            snapshot.apply(entry)?;
        }
        Ok(snapshot)
    }

    fn apply(&mut self, entry: &LedgerEntry) -> Result<(), PipeflowError> {
        match entry.event {
            LedgerEvent::RunStarted { .. } => {
                return Err(PipeflowError::ledger(format!(
                    "run {} started twice (seq {})",
                    entry.run_id, entry.seq
                )))
            }
            LedgerEvent::TaskTransition {
                ref task,
                status,
                attempt,
                exit_code,
                ref error,
                ref skip_reason,
                ref log_ref,
            } => {
                let record = self.record_mut(task)?;
                if status == TaskStatus::Pending {
                    // Reverted on resume
                    *record = TaskRunRecord::new(task);
                }
                if status == TaskStatus::Running {
                    record.started_at = Some(entry.at);
                }
                if status.is_terminal() {
                    record.finished_at = Some(entry.at);
                }
                record.status = status;
                record.attempts = attempt;
                record.exit_code = exit_code;
                record.error = error.clone();
                record.skip_reason = skip_reason.clone();
                record.log_ref = log_ref.clone();
            }
            LedgerEvent::TaskRetrying {
                ref task, attempt, ..
            } => {
                self.record_mut(task)?.attempts = attempt + 1;
            }
            LedgerEvent::CancelRequested => self.cancel_requested = true,
            LedgerEvent::RunResumed => {
                self.status = RunStatus::Running;
                self.finished_at = None;
                self.cancel_requested = false;
            }
            LedgerEvent::RunFinished { status } => {
                self.status = status;
                self.finished_at = Some(entry.at);
            }
        }
        Ok(())
    }

    fn record_mut(&mut self, task: &str) -> Result<&mut TaskRunRecord, PipeflowError> {
        let run_id = self.run_id;
        self.tasks
            .iter_mut()
            .find(|r| r.name == task)
            .ok_or_else(|| PipeflowError::ledger(format!("run {} has no task '{}'", run_id, task)))
    }

    pub fn task(&self, name: &str) -> Option<&TaskRunRecord> {
        self.tasks.iter().find(|r| r.name == name)
    }

    /// A run that never recorded its finish was interrupted
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Scheduler state for continuing this run
    pub fn into_run(self) -> Run {
        Run {
            id: self.run_id,
            pipeline: self.pipeline,
            params: self.params,
            records: self.tasks,
            cancelled: self.cancel_requested,
        }
    }
}
