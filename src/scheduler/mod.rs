// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Scheduler
//!
//! Drives one [`Run`] of an [`ExecutionPlan`] to a terminal status. All
//! decisions happen in a single async loop that owns the run: readiness,
//! dispatch, skip propagation and ledger appends. Workers execute tasks on
//! the tokio runtime and report back over a channel, so the loop only wakes
//! up on completions, retries and cancellation.

mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{PipeflowError, SkipReason};
use crate::ledger::{Ledger, LedgerEvent};
use crate::pipeline::ExecutionPlan;
use crate::run::{CancelHandle, Run, RunStatus, TaskRunRecord, TaskStatus};
use crate::runners::TaskRunner;
use crate::workspace::RunWorkspaces;

use worker::{Outcome, Worker, WorkerEvent};

/// Scheduling knobs
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum tasks running at once
    pub concurrency: usize,
    /// Stop dispatching after the first failure
    pub fail_fast: bool,
    /// Grace period for running tasks after cancellation
    pub cancel_timeout: Duration,
    /// Retries for runner errors, separate from a spec's retry policy
    pub infra_retries: u32,
    /// First delay between runner-error retries; doubles each time
    pub infra_backoff: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            fail_fast: true,
            cancel_timeout: Duration::from_secs(30),
            infra_retries: 3,
            infra_backoff: Duration::from_millis(500),
        }
    }
}

/// Executes runs against a runner and a ledger
pub struct Scheduler {
    runner: Arc<dyn TaskRunner>,
    ledger: Arc<dyn Ledger>,
    options: SchedulerOptions,
}

/// Mutable bookkeeping of one `drive` call
struct Dispatch {
    running: HashMap<usize, JoinHandle<()>>,
    /// Fail-fast tripped; nothing new starts
    halted: bool,
    /// Cancellation observed and applied
    cancelled: bool,
    abort_at: Option<Instant>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn TaskRunner>, ledger: Arc<dyn Ledger>, options: SchedulerOptions) -> Self {
        Self {
            runner,
            ledger,
            options,
        }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Execute a fresh run to completion
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        run: &mut Run,
        workspaces: &RunWorkspaces,
        cancel: &CancelHandle,
    ) -> Result<RunStatus, PipeflowError> {
        info!("Run {} of '{}' started", run.id, run.pipeline);
        self.ledger
            .append(
                run.id,
                LedgerEvent::RunStarted {
                    pipeline: run.pipeline.clone(),
                    params: run.params.clone(),
                    tasks: run.records.iter().map(|r| r.name.clone()).collect(),
                },
            )
            .await?;

        self.drive(plan, run, workspaces, cancel).await
    }

    /// Continue a run rebuilt from the ledger
    ///
    /// Tasks that were running when the previous process stopped, and tasks
    /// skipped only because of cancellation, start over from `Pending`.
    /// Every other terminal record is kept.
    pub async fn resume(
        &self,
        plan: &ExecutionPlan,
        run: &mut Run,
        workspaces: &RunWorkspaces,
        cancel: &CancelHandle,
    ) -> Result<RunStatus, PipeflowError> {
        if run.records.len() != plan.tasks.len()
            || run.records.iter().zip(&plan.tasks).any(|(r, t)| r.name != t.name)
        {
            return Err(PipeflowError::invalid_pipeline(format!(
                "run {} was started with a different task list than pipeline '{}'",
                run.id, run.pipeline
            )));
        }

        info!("Resuming run {} of '{}'", run.id, run.pipeline);
        self.ledger.append(run.id, LedgerEvent::RunResumed).await?;
        run.cancelled = false;

        for index in 0..run.records.len() {
            let record = &run.records[index];
            let revert = match record.status {
                TaskStatus::Running => true,
                TaskStatus::Skipped => record.skip_reason == Some(SkipReason::Cancelled),
                _ => false,
            };
            if revert {
                let name = record.name.clone();
                info!("Task '{}' was {}; back to pending", name, record.status);
                run.records[index] = TaskRunRecord::new(&name);
                self.record(run, index).await;
            }
        }

        self.drive(plan, run, workspaces, cancel).await
    }

    async fn drive(
        &self,
        plan: &ExecutionPlan,
        run: &mut Run,
        workspaces: &RunWorkspaces,
        cancel: &CancelHandle,
    ) -> Result<RunStatus, PipeflowError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut signal = cancel.signal();
        let workspaces = Arc::new(workspaces.clone());
        let mut state = Dispatch {
            running: HashMap::new(),
            halted: false,
            cancelled: false,
            abort_at: None,
        };

        loop {
            if !state.cancelled && cancel.is_cancelled() {
                self.on_cancel(run, &mut state).await?;
            }

            if !state.cancelled {
                self.promote(plan, run).await?;
                if !state.halted {
                    self.dispatch(plan, run, &mut state, &workspaces, cancel, &tx)
                        .await?;
                }
            }

            if state.running.is_empty() {
                break;
            }

            let abort_at = state.abort_at;
            tokio::select! {
                Some(event) = rx.recv() => self.on_event(plan, run, &mut state, event).await?,
                _ = signal.cancelled(), if !state.cancelled => {}
                _ = sleep_until(abort_at), if abort_at.is_some() => {
                    self.abort_running(run, &mut state).await?;
                }
            }
        }

        let status = run.status();
        info!("Run {} finished: {}", run.id, status);
        self.append(run, LedgerEvent::RunFinished { status }).await;
        Ok(status)
    }

    /// Pending tasks become Ready once every predecessor succeeded, or
    /// Skipped once any predecessor did not
    async fn promote(&self, plan: &ExecutionPlan, run: &mut Run) -> Result<(), PipeflowError> {
        for &index in plan.dag.topological_order() {
            if run.records[index].status != TaskStatus::Pending {
                continue;
            }

            let predecessors = plan.dag.predecessors(index);
            let blocked = predecessors.iter().copied().find(|&p| {
                matches!(
                    run.records[p].status,
                    TaskStatus::Failed | TaskStatus::Skipped
                )
            });

            if let Some(upstream) = blocked {
                let reason = SkipReason::UpstreamFailed {
                    task: run.records[upstream].name.clone(),
                };
                debug!("Skipping '{}': {}", run.records[index].name, reason);
                run.records[index].skip(reason)?;
                self.record(run, index).await;
            } else if predecessors
                .iter()
                .all(|&p| run.records[p].status == TaskStatus::Succeeded)
            {
                run.records[index].transition(TaskStatus::Ready)?;
                self.record(run, index).await;
            }
        }
        Ok(())
    }

    /// Start Ready tasks, lowest declaration index first, while slots remain
    async fn dispatch(
        &self,
        plan: &ExecutionPlan,
        run: &mut Run,
        state: &mut Dispatch,
        workspaces: &Arc<RunWorkspaces>,
        cancel: &CancelHandle,
        tx: &mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<(), PipeflowError> {
        let limit = self.options.concurrency.max(1);

        for index in 0..run.records.len() {
            if state.running.len() >= limit {
                break;
            }
            if run.records[index].status != TaskStatus::Ready {
                continue;
            }

            let record = &mut run.records[index];
            record.transition(TaskStatus::Running)?;
            record.attempts = 1;
            debug!("▶ {}", record.name);
            self.record(run, index).await;

            let worker = Worker {
                index,
                task: plan.tasks[index].clone(),
                run_id: run.id,
                pipeline: run.pipeline.clone(),
                workspaces: Arc::clone(workspaces),
                runner: Arc::clone(&self.runner),
                ledger: Arc::clone(&self.ledger),
                cancel: cancel.signal(),
                infra_retries: self.options.infra_retries,
                infra_backoff: self.options.infra_backoff,
                events: tx.clone(),
            };
            state.running.insert(index, tokio::spawn(worker.run()));
        }
        Ok(())
    }

    async fn on_event(
        &self,
        plan: &ExecutionPlan,
        run: &mut Run,
        state: &mut Dispatch,
        event: WorkerEvent,
    ) -> Result<(), PipeflowError> {
        let (index, outcome) = match event {
            WorkerEvent::Retrying {
                index,
                attempt,
                reason,
            } => {
                if !state.running.contains_key(&index) {
                    return Ok(());
                }
                run.records[index].attempts = attempt + 1;
                let task = run.records[index].name.clone();
                self.append(run, LedgerEvent::TaskRetrying { task, attempt, reason })
                    .await;
                return Ok(());
            }
            WorkerEvent::Finished { index, outcome } => (index, outcome),
        };

        // Already settled by an abort
        if state.running.remove(&index).is_none() {
            return Ok(());
        }

        let record = &mut run.records[index];
        match outcome {
            Outcome::Succeeded { attempts, log_ref } => {
                record.attempts = attempts;
                record.exit_code = Some(0);
                record.log_ref = log_ref;
                record.transition(TaskStatus::Succeeded)?;
                debug!("✓ {}", record.name);
            }
            Outcome::Failed {
                attempts,
                error,
                exit_code,
                log_ref,
            } => {
                record.attempts = attempts;
                record.log_ref = log_ref;
                warn!("✗ {}: {}", record.name, error);
                record.fail(error, exit_code)?;
            }
            Outcome::Interrupted { attempts, log_ref } => {
                record.attempts = attempts;
                record.log_ref = log_ref;
                record.skip(SkipReason::Cancelled)?;
                debug!("■ {} interrupted", record.name);
            }
        }
        self.record(run, index).await;

        if run.records[index].status == TaskStatus::Failed && self.options.fail_fast && !state.halted {
            self.fail_fast(plan, run, state, index).await?;
        }
        Ok(())
    }

    /// Skip everything not yet running after `failed` failed
    async fn fail_fast(
        &self,
        plan: &ExecutionPlan,
        run: &mut Run,
        state: &mut Dispatch,
        failed: usize,
    ) -> Result<(), PipeflowError> {
        state.halted = true;
        let descendants = plan.dag.descendants(failed);
        let failed_name = run.records[failed].name.clone();
        info!("Fail-fast: '{}' failed, skipping tasks not yet started", failed_name);

        for index in 0..run.records.len() {
            if !matches!(run.records[index].status, TaskStatus::Pending | TaskStatus::Ready) {
                continue;
            }
            let reason = if descendants.contains(&index) {
                SkipReason::UpstreamFailed {
                    task: failed_name.clone(),
                }
            } else {
                SkipReason::FailFast {
                    task: failed_name.clone(),
                }
            };
            run.records[index].skip(reason)?;
            self.record(run, index).await;
        }
        Ok(())
    }

    async fn on_cancel(&self, run: &mut Run, state: &mut Dispatch) -> Result<(), PipeflowError> {
        warn!("Run {} cancelled", run.id);
        state.cancelled = true;
        state.abort_at = Some(Instant::now() + self.options.cancel_timeout);
        run.cancelled = true;
        self.append(run, LedgerEvent::CancelRequested).await;

        for index in 0..run.records.len() {
            if matches!(run.records[index].status, TaskStatus::Pending | TaskStatus::Ready) {
                run.records[index].skip(SkipReason::Cancelled)?;
                self.record(run, index).await;
            }
        }
        Ok(())
    }

    /// Grace period expired: stop waiting for workers that ignored cancellation
    async fn abort_running(&self, run: &mut Run, state: &mut Dispatch) -> Result<(), PipeflowError> {
        state.abort_at = None;
        let mut indices: Vec<usize> = state.running.keys().copied().collect();
        indices.sort_unstable();

        for index in indices {
            if let Some(handle) = state.running.remove(&index) {
                handle.abort();
            }
            warn!("Aborting '{}' after cancellation timeout", run.records[index].name);
            run.records[index].skip(SkipReason::Cancelled)?;
            self.record(run, index).await;
        }
        Ok(())
    }

    /// Append the current state of a record
    async fn record(&self, run: &Run, index: usize) {
        self.append(run, LedgerEvent::transition(&run.records[index]))
            .await;
    }

    // The in-memory run stays authoritative if the ledger cannot be written
    async fn append(&self, run: &Run, event: LedgerEvent) {
        if let Err(e) = self.ledger.append(run.id, event).await {
            warn!("Ledger append for run {} failed: {}", run.id, e);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests;
