// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Task workers
//!
//! A worker owns one dispatched task until it settles: it runs attempts,
//! applies the retry policy and reports back to the scheduler. Workers never
//! touch the run itself.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::{PipeflowError, TaskError};
use crate::ledger::Ledger;
use crate::pipeline::PlannedTask;
use crate::run::{CancelSignal, RunId};
use crate::runners::{TaskOutput, TaskRunner};
use crate::workspace::RunWorkspaces;

/// Message from a worker to the scheduler loop
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Retrying {
        index: usize,
        attempt: u32,
        reason: String,
    },
    Finished {
        index: usize,
        outcome: Outcome,
    },
}

/// How a dispatched task settled
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Succeeded {
        attempts: u32,
        log_ref: Option<String>,
    },
    Failed {
        attempts: u32,
        error: TaskError,
        exit_code: Option<i32>,
        log_ref: Option<String>,
    },
    /// Stopped by run cancellation
    Interrupted {
        attempts: u32,
        log_ref: Option<String>,
    },
}

/// Everything a worker needs, moved into its tokio task
pub(crate) struct Worker {
    pub index: usize,
    pub task: PlannedTask,
    pub run_id: RunId,
    pub pipeline: String,
    pub workspaces: Arc<RunWorkspaces>,
    pub runner: Arc<dyn TaskRunner>,
    pub ledger: Arc<dyn Ledger>,
    pub cancel: CancelSignal,
    pub infra_retries: u32,
    pub infra_backoff: Duration,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
}

/// Result of a single attempt
enum Attempt {
    Output(TaskOutput),
    TimedOut(Duration),
    Unavailable(PipeflowError),
}

impl Worker {
    pub async fn run(self) {
        let outcome = self.settle().await;
        // The scheduler outlives its workers unless it aborted this one
        let _ = self.events.send(WorkerEvent::Finished {
            index: self.index,
            outcome,
        });
    }

    async fn settle(&self) -> Outcome {
        let retry = &self.task.retry;
        let mut attempt = 0;
        let mut failed_attempts = 0;
        let mut infra_failures = 0;

        loop {
            attempt += 1;

            let output = match self.attempt(attempt).await {
                Attempt::Output(output) => output,
                Attempt::TimedOut(limit) => {
                    failed_attempts += 1;
                    if failed_attempts < retry.max_attempts() {
                        let reason = format!("timed out after {:?}", limit);
                        if !self.backoff(attempt, reason, retry.delay_for(failed_attempts)).await {
                            return Outcome::Interrupted { attempts: attempt, log_ref: None };
                        }
                        continue;
                    }
                    return Outcome::Failed {
                        attempts: attempt,
                        error: TaskError::TimedOut {
                            millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                        },
                        exit_code: None,
                        log_ref: None,
                    };
                }
                Attempt::Unavailable(e) if e.is_infrastructure() && infra_failures < self.infra_retries => {
                    infra_failures += 1;
                    let delay = self.infra_backoff.saturating_mul(1 << (infra_failures - 1).min(16));
                    if !self.backoff(attempt, e.to_string(), delay).await {
                        return Outcome::Interrupted { attempts: attempt, log_ref: None };
                    }
                    continue;
                }
                Attempt::Unavailable(e) => {
                    return Outcome::Failed {
                        attempts: attempt,
                        error: TaskError::Infrastructure {
                            message: e.to_string(),
                        },
                        exit_code: None,
                        log_ref: None,
                    };
                }
            };

            let log_ref = self.store_log(attempt, &output).await;

            if output.interrupted {
                return Outcome::Interrupted { attempts: attempt, log_ref };
            }
            if output.success() {
                return Outcome::Succeeded { attempts: attempt, log_ref };
            }

            failed_attempts += 1;
            if failed_attempts < retry.max_attempts() {
                let reason = format!("exited with code {}", output.exit_code);
                if !self.backoff(attempt, reason, retry.delay_for(failed_attempts)).await {
                    return Outcome::Interrupted { attempts: attempt, log_ref };
                }
                continue;
            }

            return Outcome::Failed {
                attempts: attempt,
                error: TaskError::Exit {
                    code: output.exit_code,
                    attempts: attempt,
                },
                exit_code: Some(output.exit_code),
                log_ref,
            };
        }
    }

    async fn attempt(&self, attempt: u32) -> Attempt {
        let invocation = match self
            .task
            .invocation(self.run_id, &self.pipeline, &self.workspaces, attempt)
        {
            Ok(invocation) => invocation,
            Err(e) => return Attempt::Unavailable(e),
        };

        debug!("Running '{}' attempt {}", self.task.name, attempt);
        let run = self.runner.run(&invocation, self.cancel.clone());
        let result = match self.task.timeout {
            // Dropping the runner future kills the child process
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => return Attempt::TimedOut(limit),
            },
            None => run.await,
        };

        match result {
            Ok(output) => Attempt::Output(output),
            Err(e) => Attempt::Unavailable(e),
        }
    }

    /// Report a retry and sleep; false when cancelled during the wait
    async fn backoff(&self, attempt: u32, reason: String, delay: Duration) -> bool {
        warn!(
            "Task '{}' attempt {} failed ({}), retrying in {:?}",
            self.task.name, attempt, reason, delay
        );
        let _ = self.events.send(WorkerEvent::Retrying {
            index: self.index,
            attempt,
            reason,
        });

        let mut cancel = self.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }

    async fn store_log(&self, attempt: u32, output: &TaskOutput) -> Option<String> {
        match self
            .ledger
            .store_log(self.run_id, &self.task.name, attempt, &output.log_text())
            .await
        {
            Ok(log_ref) => Some(log_ref),
            Err(e) => {
                warn!("Could not store output of '{}': {}", self.task.name, e);
                None
            }
        }
    }
}
