// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Engine
//!
//! The embedding surface: a catalog of validated pipelines plus the runner,
//! ledger and workspace store shared by every run. Runs are independent
//! objects, so the same pipeline can run several times at once.
//!
//! Each catalog entry carries its own task registry: the engine's shared
//! specs plus that pipeline's inline specs. Registering another pipeline
//! never changes what an earlier one executes.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::errors::PipeflowError;
use crate::ledger::{FileLedger, Ledger, RunSnapshot};
use crate::pipeline::{ExecutionPlan, PipelineDefinition, PipelineValidator, ResolvedParams};
use crate::registry::TaskRegistry;
use crate::run::{CancelHandle, Run, RunId, RunStatus, TaskRunRecord, TaskStatus};
use crate::runners::{create_runner, TaskRunner};
use crate::scheduler::Scheduler;
use crate::workspace::{RunWorkspaces, WorkspaceStore};

/// Final state of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline: String,
    pub status: RunStatus,
    pub tasks: Vec<TaskRunRecord>,
}

impl RunReport {
    fn from_run(run: Run, status: RunStatus) -> Self {
        Self {
            run_id: run.id,
            pipeline: run.pipeline,
            status,
            tasks: run.records,
        }
    }

    fn from_snapshot(snapshot: RunSnapshot) -> Self {
        Self {
            run_id: snapshot.run_id,
            pipeline: snapshot.pipeline,
            status: snapshot.status,
            tasks: snapshot.tasks,
        }
    }

    pub fn task(&self, name: &str) -> Option<&TaskRunRecord> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// `Ok` for a successful run, otherwise the error that best explains it
    pub fn into_result(self) -> Result<Self, PipeflowError> {
        match self.status {
            RunStatus::Succeeded => Ok(self),
            RunStatus::Cancelled => Err(PipeflowError::Cancelled {
                run_id: self.run_id.to_string(),
            }),
            RunStatus::Failed | RunStatus::Running => {
                let failed = self
                    .tasks
                    .iter()
                    .find(|t| t.status == TaskStatus::Failed)
                    .and_then(|t| Some((t.name.clone(), t.error.clone()?)));
                match failed {
                    Some((task, error)) => Err(PipeflowError::TaskFailed { task, error }),
                    None => Err(PipeflowError::invalid_pipeline(format!(
                        "run {} did not complete",
                        self.run_id
                    ))),
                }
            }
        }
    }
}

struct ActiveRun {
    cancel: Arc<CancelHandle>,
    /// Taken by the first waiter
    handle: Option<JoinHandle<Result<RunReport, PipeflowError>>>,
}

type ActiveRuns = Arc<Mutex<HashMap<RunId, ActiveRun>>>;

/// A registered pipeline and the specs its tasks resolve against
struct CatalogEntry {
    definition: Arc<PipelineDefinition>,
    registry: TaskRegistry,
}

/// Pipeline engine
pub struct Engine {
    config: EngineConfig,
    registry: TaskRegistry,
    pipelines: HashMap<String, CatalogEntry>,
    runner: Arc<dyn TaskRunner>,
    ledger: Arc<dyn Ledger>,
    workspaces: WorkspaceStore,
    active: ActiveRuns,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        registry: TaskRegistry,
        runner: Arc<dyn TaskRunner>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        let workspaces = config.workspace_store();
        Self {
            config,
            registry,
            pipelines: HashMap::new(),
            runner,
            ledger,
            workspaces,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Engine with the configured runner, a file ledger and the spec directory loaded
    pub fn from_config(config: EngineConfig) -> Result<Self, PipeflowError> {
        let runner = create_runner(config.runner, &config.shell)?;
        let ledger = Arc::new(FileLedger::new(&config.ledger_dir)?);

        let mut registry = TaskRegistry::new();
        if config.specs_dir.is_dir() {
            let loaded = registry.load_dir(&config.specs_dir)?;
            info!("Loaded {} task specs from {}", loaded, config.specs_dir.display());
        }

        Ok(Self::new(config, registry, runner, ledger))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Specs shared by every pipeline
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Fail early when the configured runner cannot execute anything
    pub async fn check_runner(&self) -> Result<(), PipeflowError> {
        if self.runner.check_available().await? {
            Ok(())
        } else {
            Err(PipeflowError::RunnerUnavailable {
                runner: self.runner.name().to_string(),
                error: "executable not found on PATH".to_string(),
            })
        }
    }

    /// Validate and add a pipeline
    ///
    /// Inline specs are visible to this pipeline only, shadowing shared
    /// specs of the same name. Returns validation warnings.
    pub fn register_pipeline(&mut self, pipeline: PipelineDefinition) -> Result<Vec<String>, PipeflowError> {
        let mut registry = self.registry.clone();
        registry.extend(pipeline.specs.iter().cloned());
        let warnings = PipelineValidator::validate(&pipeline, &registry).into_result()?;

        for warning in &warnings {
            warn!("{}: {}", pipeline.name, warning);
        }
        self.pipelines.insert(
            pipeline.name.clone(),
            CatalogEntry {
                definition: Arc::new(pipeline),
                registry,
            },
        );
        Ok(warnings)
    }

    pub fn pipeline(&self, name: &str) -> Result<&Arc<PipelineDefinition>, PipeflowError> {
        Ok(&self.entry(name)?.definition)
    }

    fn entry(&self, name: &str) -> Result<&CatalogEntry, PipeflowError> {
        self.pipelines
            .get(name)
            .ok_or_else(|| PipeflowError::PipelineNotFound {
                name: name.to_string(),
            })
    }

    /// Resolve overrides into an execution plan without running it
    pub fn plan(&self, name: &str, overrides: &HashMap<String, String>) -> Result<ExecutionPlan, PipeflowError> {
        let entry = self.entry(name)?;
        ExecutionPlan::build(Arc::clone(&entry.definition), &entry.registry, overrides)
    }

    /// Start a run in the background and return its id
    pub async fn trigger(&self, name: &str, overrides: &HashMap<String, String>) -> Result<RunId, PipeflowError> {
        let plan = self.plan(name, overrides)?;
        let run = Run::new(
            &plan.pipeline.name,
            plan.params.as_map().clone(),
            &plan.pipeline.task_names(),
        );
        self.start(plan, run, false).await
    }

    /// Start a run and wait for it to finish
    pub async fn trigger_and_wait(
        &self,
        name: &str,
        overrides: &HashMap<String, String>,
    ) -> Result<RunReport, PipeflowError> {
        let run_id = self.trigger(name, overrides).await?;
        self.wait(run_id).await
    }

    /// Continue a run that stopped before finishing, or was cancelled
    pub async fn resume(&self, run_id: RunId) -> Result<RunId, PipeflowError> {
        if self.is_active(run_id) {
            return Err(PipeflowError::invalid_pipeline(format!(
                "run {} is still active",
                run_id
            )));
        }

        let snapshot = self.ledger.snapshot(run_id).await?;
        if snapshot.status == RunStatus::Succeeded {
            return Err(PipeflowError::InvalidPipeline {
                reason: format!("run {} already succeeded", run_id),
                help: Some("Trigger a new run instead".to_string()),
            });
        }

        let entry = self.entry(&snapshot.pipeline)?;
        let params = ResolvedParams::from(snapshot.params.clone());
        let plan = ExecutionPlan::with_params(Arc::clone(&entry.definition), &entry.registry, params)?;
        self.start(plan, snapshot.into_run(), true).await
    }

    async fn start(&self, plan: ExecutionPlan, mut run: Run, resume: bool) -> Result<RunId, PipeflowError> {
        let run_id = run.id;
        let dirs = self.allocate_workspaces(run_id, &plan).await?;

        let cancel = Arc::new(CancelHandle::new());
        let scheduler = Scheduler::new(
            Arc::clone(&self.runner),
            Arc::clone(&self.ledger),
            self.config.scheduler_options(),
        );
        let store = self.workspaces.clone();
        let run_cancel = Arc::clone(&cancel);
        let active = Arc::clone(&self.active);

        // Held across the spawn so a fast run cannot deregister before it is registered
        let mut runs = self.lock_active();
        let handle = tokio::spawn(async move {
            let result: Result<RunReport, PipeflowError> = async {
                let status = if resume {
                    scheduler.resume(&plan, &mut run, &dirs, &run_cancel).await?
                } else {
                    scheduler.execute(&plan, &mut run, &dirs, &run_cancel).await?
                };

                // Failed and cancelled runs keep their workspaces for resume
                if status == RunStatus::Succeeded {
                    if let Err(e) = store.release(run.id).await {
                        warn!("{}", e);
                    }
                }
                Ok(RunReport::from_run(run, status))
            }
            .await;

            lock(&active).remove(&run_id);
            result
        });

        runs.insert(
            run_id,
            ActiveRun {
                cancel,
                handle: Some(handle),
            },
        );
        Ok(run_id)
    }

    /// Allocate workspaces, retrying with backoff like any infrastructure step
    async fn allocate_workspaces(&self, run_id: RunId, plan: &ExecutionPlan) -> Result<RunWorkspaces, PipeflowError> {
        let options = self.config.scheduler_options();
        let mut delay = options.infra_backoff;
        let mut failures = 0;

        loop {
            match self.workspaces.allocate(run_id, &plan.pipeline.workspaces).await {
                Ok(dirs) => return Ok(dirs),
                Err(e) if failures < options.infra_retries => {
                    failures += 1;
                    warn!("{}; retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for a run to finish
    ///
    /// The run stays cancellable until it finishes. A run that already
    /// finished, or is being awaited elsewhere, is reported from the ledger
    /// once it is no longer active.
    pub async fn wait(&self, run_id: RunId) -> Result<RunReport, PipeflowError> {
        let handle = self
            .lock_active()
            .get_mut(&run_id)
            .and_then(|run| run.handle.take());

        let Some(handle) = handle else {
            while self.is_active(run_id) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            return Ok(RunReport::from_snapshot(self.ledger.snapshot(run_id).await?));
        };

        handle.await.map_err(|e| PipeflowError::Io {
            message: format!("run {} stopped abnormally: {}", run_id, e),
        })?
    }

    /// Request cancellation of an active run
    pub fn cancel(&self, run_id: RunId) -> Result<(), PipeflowError> {
        let active = self.lock_active();
        let run = active.get(&run_id).ok_or_else(|| PipeflowError::RunNotFound {
            run_id: run_id.to_string(),
        })?;
        info!("Cancelling run {}", run_id);
        run.cancel.cancel();
        Ok(())
    }

    /// Cancel every active run
    pub fn cancel_all(&self) {
        for (run_id, run) in self.lock_active().iter() {
            info!("Cancelling run {}", run_id);
            run.cancel.cancel();
        }
    }

    /// Status snapshot from the ledger
    pub async fn status(&self, run_id: RunId) -> Result<RunSnapshot, PipeflowError> {
        self.ledger.snapshot(run_id).await
    }

    pub fn is_active(&self, run_id: RunId) -> bool {
        self.lock_active().contains_key(&run_id)
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<RunId, ActiveRun>> {
        lock(&self.active)
    }
}

// A panic while holding the lock leaves the map itself intact
fn lock(active: &ActiveRuns) -> MutexGuard<'_, HashMap<RunId, ActiveRun>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
