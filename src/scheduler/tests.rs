// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

use super::*;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::errors::TaskError;
use crate::ledger::MemoryLedger;
use crate::pipeline::{PipelineDefinition, TaskNode};
use crate::registry::{Backoff, RetryPolicy, TaskRegistry, TaskSpec};
use crate::run::CancelSignal;
use crate::runners::{TaskInvocation, TaskOutput};

/// What the scripted runner does for one attempt
#[derive(Debug, Clone)]
enum Step {
    Exit(i32),
    Sleep(u64, i32),
    /// Runs until cancelled
    Hang,
    /// Sleeps and ignores cancellation
    Stubborn(u64),
    Unavailable,
}

#[derive(Default)]
struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    started: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRunner {
    fn with(steps: Vec<(&str, Vec<Step>)>) -> Arc<Self> {
        let runner = Self::default();
        {
            let mut scripts = runner.scripts.lock().unwrap();
            for (task, task_steps) in steps {
                scripts.insert(task.to_string(), task_steps.into());
            }
        }
        Arc::new(runner)
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    fn output(code: i32) -> TaskOutput {
        TaskOutput {
            exit_code: code,
            stdout: format!("exit {}", code),
            stderr: String::new(),
            duration: Duration::from_millis(1),
            interrupted: false,
        }
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run(
        &self,
        invocation: &TaskInvocation,
        mut cancel: CancelSignal,
    ) -> Result<TaskOutput, PipeflowError> {
        self.started.lock().unwrap().push(invocation.task.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&invocation.task)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Exit(0));

        let result = match step {
            Step::Exit(code) => Ok(Self::output(code)),
            Step::Sleep(ms, code) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Self::output(code))
            }
            Step::Hang => {
                cancel.cancelled().await;
                let mut output = Self::output(130);
                output.interrupted = true;
                Ok(output)
            }
            Step::Stubborn(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Self::output(0))
            }
            Step::Unavailable => Err(PipeflowError::RunnerUnavailable {
                runner: "scripted".into(),
                error: "connection refused".into(),
            }),
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn check_available(&self) -> Result<bool, PipeflowError> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn options() -> SchedulerOptions {
    SchedulerOptions {
        concurrency: 4,
        fail_fast: true,
        cancel_timeout: Duration::from_secs(5),
        infra_retries: 3,
        infra_backoff: Duration::from_millis(1),
    }
}

fn definition(name: &str, tasks: Vec<TaskNode>) -> PipelineDefinition {
    PipelineDefinition {
        version: "1".into(),
        name: name.into(),
        description: None,
        params: vec![],
        workspaces: vec![],
        specs: vec![],
        tasks,
    }
}

/// init → clone → {lint, tests} → build → deploy
fn ci_cd() -> PipelineDefinition {
    definition(
        "ci-cd",
        vec![
            TaskNode::new("init", "step"),
            TaskNode::new("clone", "step").after(&["init"]),
            TaskNode::new("lint", "step").after(&["clone"]),
            TaskNode::new("tests", "step").after(&["clone"]),
            TaskNode::new("build", "step").after(&["lint", "tests"]),
            TaskNode::new("deploy", "step").after(&["build"]),
        ],
    )
}

/// a and b independent, c after a
fn fork() -> PipelineDefinition {
    definition(
        "fork",
        vec![
            TaskNode::new("a", "step"),
            TaskNode::new("b", "step"),
            TaskNode::new("c", "step").after(&["a"]),
        ],
    )
}

fn plan(def: PipelineDefinition) -> ExecutionPlan {
    let mut registry = TaskRegistry::new();
    registry.register(TaskSpec::script("step", "true"));
    ExecutionPlan::build(Arc::new(def), &registry, &HashMap::new()).unwrap()
}

fn new_run(plan: &ExecutionPlan) -> Run {
    Run::new(
        &plan.pipeline.name,
        plan.params.as_map().clone(),
        &plan.pipeline.task_names(),
    )
}

struct Finished {
    run: Run,
    status: RunStatus,
    ledger: Arc<MemoryLedger>,
}

async fn execute(plan: &ExecutionPlan, runner: Arc<ScriptedRunner>, options: SchedulerOptions) -> Finished {
    let ledger = Arc::new(MemoryLedger::new());
    let scheduler = Scheduler::new(runner, ledger.clone(), options);
    let mut run = new_run(plan);

    let status = tokio::time::timeout(
        Duration::from_secs(10),
        scheduler.execute(plan, &mut run, &RunWorkspaces::new(), &CancelHandle::new()),
    )
    .await
    .expect("run should finish")
    .unwrap();

    Finished { run, status, ledger }
}

fn status_of(run: &Run, task: &str) -> TaskStatus {
    run.record(task).unwrap().status
}

fn skip_reason(run: &Run, task: &str) -> Option<SkipReason> {
    run.record(task).unwrap().skip_reason.clone()
}

#[tokio::test]
async fn test_all_tasks_succeed() {
    let plan = plan(ci_cd());
    let runner = ScriptedRunner::with(vec![]);
    let Finished { run, status, ledger } = execute(&plan, runner.clone(), options()).await;

    assert_eq!(status, RunStatus::Succeeded);
    assert!(run.records.iter().all(|r| r.status == TaskStatus::Succeeded));

    // Every task started only after its predecessors
    let started = runner.started();
    for (index, name) in plan.pipeline.task_names().iter().enumerate() {
        let position = started.iter().position(|s| s == name).unwrap();
        for &pred in plan.dag.predecessors(index) {
            let pred_position = started.iter().position(|s| s == plan.dag.name(pred)).unwrap();
            assert!(pred_position < position, "{} started before {}", name, plan.dag.name(pred));
        }
    }

    let snapshot = ledger.snapshot(run.id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Succeeded);
    assert_eq!(snapshot.tasks, run.records.iter().map(|r| {
        let mut r = r.clone();
        // Ledger timestamps are the append times
        r.started_at = snapshot.task(&r.name).unwrap().started_at;
        r.finished_at = snapshot.task(&r.name).unwrap().finished_at;
        r
    }).collect::<Vec<_>>());
    assert!(snapshot.tasks.iter().all(|r| r.log_ref.is_some()));
}

#[tokio::test]
async fn test_lint_failure_skips_build_and_deploy() {
    let plan = plan(ci_cd());
    let runner = ScriptedRunner::with(vec![
        ("lint", vec![Step::Exit(1)]),
        ("tests", vec![Step::Sleep(50, 0)]),
    ]);
    let Finished { run, status, .. } = execute(&plan, runner, options()).await;

    assert_eq!(status, RunStatus::Failed);
    assert_eq!(status_of(&run, "lint"), TaskStatus::Failed);
    assert_eq!(status_of(&run, "tests"), TaskStatus::Succeeded);
    assert_eq!(status_of(&run, "build"), TaskStatus::Skipped);
    assert_eq!(status_of(&run, "deploy"), TaskStatus::Skipped);
    assert_eq!(
        skip_reason(&run, "deploy"),
        Some(SkipReason::UpstreamFailed { task: "lint".into() })
    );
    assert_eq!(
        run.record("lint").unwrap().error,
        Some(TaskError::Exit { code: 1, attempts: 1 })
    );
}

#[tokio::test]
async fn test_fail_fast_skips_independent_branches() {
    let plan = plan(fork());
    let runner = ScriptedRunner::with(vec![("a", vec![Step::Exit(2)])]);
    let mut opts = options();
    opts.concurrency = 1;
    let Finished { run, status, .. } = execute(&plan, runner.clone(), opts).await;

    assert_eq!(status, RunStatus::Failed);
    assert_eq!(runner.started(), vec!["a"]);
    assert_eq!(skip_reason(&run, "b"), Some(SkipReason::FailFast { task: "a".into() }));
    assert_eq!(skip_reason(&run, "c"), Some(SkipReason::UpstreamFailed { task: "a".into() }));
}

#[tokio::test]
async fn test_continue_on_error_runs_independent_branches() {
    let plan = plan(fork());
    let runner = ScriptedRunner::with(vec![("a", vec![Step::Exit(2)])]);
    let mut opts = options();
    opts.concurrency = 1;
    opts.fail_fast = false;
    let Finished { run, status, .. } = execute(&plan, runner, opts).await;

    assert_eq!(status, RunStatus::Failed);
    assert_eq!(status_of(&run, "b"), TaskStatus::Succeeded);
    assert_eq!(skip_reason(&run, "c"), Some(SkipReason::UpstreamFailed { task: "a".into() }));
}

#[tokio::test]
async fn test_dispatch_follows_declaration_order() {
    let plan = plan(definition(
        "order",
        vec![
            TaskNode::new("b", "step"),
            TaskNode::new("a", "step"),
            TaskNode::new("c", "step"),
        ],
    ));
    let runner = ScriptedRunner::with(vec![]);
    let mut opts = options();
    opts.concurrency = 1;
    execute(&plan, runner.clone(), opts).await;

    assert_eq!(runner.started(), vec!["b", "a", "c"]);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let plan = plan(definition(
        "wide",
        (0..5).map(|i| TaskNode::new(&format!("t{}", i), "step")).collect(),
    ));
    let names: Vec<String> = (0..5).map(|i| format!("t{}", i)).collect();
    let runner = ScriptedRunner::with(
        names
            .iter()
            .map(|name| (name.as_str(), vec![Step::Sleep(30, 0)]))
            .collect(),
    );
    let mut opts = options();
    opts.concurrency = 2;

    let Finished { status, .. } = execute(&plan, runner.clone(), opts).await;

    assert_eq!(status, RunStatus::Succeeded);
    assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_until_success() {
    let mut plan = plan(fork());
    plan.tasks[0].retry = RetryPolicy::new(2, Duration::from_millis(1), Backoff::Exponential);
    let runner = ScriptedRunner::with(vec![("a", vec![Step::Exit(1), Step::Exit(1), Step::Exit(0)])]);
    let Finished { run, status, ledger } = execute(&plan, runner, options()).await;

    assert_eq!(status, RunStatus::Succeeded);
    assert_eq!(run.record("a").unwrap().attempts, 3);

    let retries = ledger
        .entries(run.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e.event, LedgerEvent::TaskRetrying { .. }))
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let mut plan = plan(fork());
    plan.tasks[1].retry = RetryPolicy::new(1, Duration::from_millis(1), Backoff::Fixed);
    let runner = ScriptedRunner::with(vec![("b", vec![Step::Exit(4), Step::Exit(5), Step::Exit(0)])]);
    let Finished { run, status, .. } = execute(&plan, runner, options()).await;

    assert_eq!(status, RunStatus::Failed);
    let record = run.record("b").unwrap();
    assert_eq!(record.error, Some(TaskError::Exit { code: 5, attempts: 2 }));
    assert_eq!(record.exit_code, Some(5));
}

#[tokio::test]
async fn test_infrastructure_errors_are_retried() {
    let plan = plan(fork());
    let runner = ScriptedRunner::with(vec![("a", vec![Step::Unavailable, Step::Unavailable])]);
    let Finished { run, status, .. } = execute(&plan, runner, options()).await;

    assert_eq!(status, RunStatus::Succeeded);
    assert_eq!(run.record("a").unwrap().attempts, 3);
}

#[tokio::test]
async fn test_infrastructure_errors_surface_as_task_failure() {
    let plan = plan(fork());
    let runner = ScriptedRunner::with(vec![("a", vec![Step::Unavailable, Step::Unavailable, Step::Unavailable])]);
    let mut opts = options();
    opts.infra_retries = 2;
    let Finished { run, status, .. } = execute(&plan, runner, opts).await;

    assert_eq!(status, RunStatus::Failed);
    assert!(matches!(
        run.record("a").unwrap().error,
        Some(TaskError::Infrastructure { ref message }) if message.contains("connection refused")
    ));
}

#[tokio::test]
async fn test_timeout_fails_the_task() {
    let mut plan = plan(fork());
    plan.tasks[0].timeout = Some(Duration::from_millis(30));
    let runner = ScriptedRunner::with(vec![("a", vec![Step::Sleep(5_000, 0)])]);
    let Finished { run, status, .. } = execute(&plan, runner, options()).await;

    assert_eq!(status, RunStatus::Failed);
    assert_eq!(run.record("a").unwrap().error, Some(TaskError::TimedOut { millis: 30 }));
}

async fn cancel_when_started(runner: &ScriptedRunner, task: &str, cancel: &CancelHandle) {
    while !runner.started().iter().any(|t| t == task) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();
}

#[tokio::test]
async fn test_cancel_while_build_running() {
    let plan = plan(ci_cd());
    let runner = ScriptedRunner::with(vec![("build", vec![Step::Hang])]);
    let ledger = Arc::new(MemoryLedger::new());
    let scheduler = Scheduler::new(runner.clone(), ledger.clone(), options());
    let mut run = new_run(&plan);
    let cancel = CancelHandle::new();
    let workspaces = RunWorkspaces::new();

    let (status, _) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(
            scheduler.execute(&plan, &mut run, &workspaces, &cancel),
            cancel_when_started(&runner, "build", &cancel)
        )
    })
    .await
    .expect("build should stop within the cancel timeout");

    assert_eq!(status.unwrap(), RunStatus::Cancelled);
    assert_eq!(status_of(&run, "build"), TaskStatus::Skipped);
    assert_eq!(status_of(&run, "deploy"), TaskStatus::Skipped);
    assert_eq!(skip_reason(&run, "deploy"), Some(SkipReason::Cancelled));
    assert!(!runner.started().contains(&"deploy".to_string()));

    let snapshot = ledger.snapshot(run.id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Cancelled);
    assert!(snapshot.cancel_requested);
}

#[tokio::test]
async fn test_stubborn_task_is_aborted_after_cancel_timeout() {
    let plan = plan(ci_cd());
    let runner = ScriptedRunner::with(vec![("build", vec![Step::Stubborn(30_000)])]);
    let mut opts = options();
    opts.cancel_timeout = Duration::from_millis(50);
    let ledger = Arc::new(MemoryLedger::new());
    let scheduler = Scheduler::new(runner.clone(), ledger.clone(), opts);
    let mut run = new_run(&plan);
    let cancel = CancelHandle::new();
    let workspaces = RunWorkspaces::new();

    let (status, _) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(
            scheduler.execute(&plan, &mut run, &workspaces, &cancel),
            cancel_when_started(&runner, "build", &cancel)
        )
    })
    .await
    .expect("abort should end the run");

    assert_eq!(status.unwrap(), RunStatus::Cancelled);
    assert_eq!(status_of(&run, "build"), TaskStatus::Skipped);
    assert_eq!(skip_reason(&run, "build"), Some(SkipReason::Cancelled));
    assert_eq!(run.record("build").unwrap().error, None);
    assert_eq!(skip_reason(&run, "deploy"), Some(SkipReason::Cancelled));

    let snapshot = ledger.snapshot(run.id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Cancelled);
    assert_eq!(snapshot.tasks[4].status, TaskStatus::Skipped);
}

#[tokio::test]
async fn test_aborted_run_can_be_resumed() {
    let plan = plan(ci_cd());
    let runner = ScriptedRunner::with(vec![("build", vec![Step::Stubborn(30_000)])]);
    let mut opts = options();
    opts.cancel_timeout = Duration::from_millis(50);
    let ledger = Arc::new(MemoryLedger::new());
    let scheduler = Scheduler::new(runner.clone(), ledger.clone(), opts);
    let mut run = new_run(&plan);
    let cancel = CancelHandle::new();
    let workspaces = RunWorkspaces::new();

    let (status, _) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(
            scheduler.execute(&plan, &mut run, &workspaces, &cancel),
            cancel_when_started(&runner, "build", &cancel)
        )
    })
    .await
    .expect("abort should end the run");
    assert_eq!(status.unwrap(), RunStatus::Cancelled);

    // The next build attempt follows the default script and exits 0
    let mut resumed = ledger.snapshot(run.id).await.unwrap().into_run();
    let status = tokio::time::timeout(
        Duration::from_secs(5),
        scheduler.resume(&plan, &mut resumed, &workspaces, &CancelHandle::new()),
    )
    .await
    .expect("resume should finish")
    .unwrap();

    assert_eq!(status, RunStatus::Succeeded);
    assert_eq!(status_of(&resumed, "build"), TaskStatus::Succeeded);
    assert_eq!(status_of(&resumed, "deploy"), TaskStatus::Succeeded);
    assert_eq!(runner.started().iter().filter(|t| *t == "build").count(), 2);
}

#[tokio::test]
async fn test_resume_continues_from_ledger() {
    let plan = plan(ci_cd());
    let ledger = Arc::new(MemoryLedger::new());
    let mut crashed = new_run(&plan);

    // A previous process got as far as running lint
    ledger
        .append(
            crashed.id,
            LedgerEvent::RunStarted {
                pipeline: crashed.pipeline.clone(),
                params: BTreeMap::new(),
                tasks: crashed.records.iter().map(|r| r.name.clone()).collect(),
            },
        )
        .await
        .unwrap();
    for (index, status) in [(0, TaskStatus::Succeeded), (1, TaskStatus::Succeeded), (2, TaskStatus::Running)] {
        crashed.records[index].status = status;
        crashed.records[index].attempts = 1;
        ledger
            .append(crashed.id, LedgerEvent::transition(&crashed.records[index]))
            .await
            .unwrap();
    }

    let mut run = ledger.snapshot(crashed.id).await.unwrap().into_run();
    let runner = ScriptedRunner::with(vec![]);
    let scheduler = Scheduler::new(runner.clone(), ledger.clone(), options());
    let status = scheduler
        .resume(&plan, &mut run, &RunWorkspaces::new(), &CancelHandle::new())
        .await
        .unwrap();

    assert_eq!(status, RunStatus::Succeeded);
    let mut started = runner.started();
    started.sort();
    assert_eq!(started, vec!["build", "deploy", "lint", "tests"]);

    let snapshot = ledger.snapshot(run.id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Succeeded);
    assert!(snapshot.tasks.iter().all(|r| r.status == TaskStatus::Succeeded));
}

#[tokio::test]
async fn test_resume_rejects_a_different_pipeline() {
    let plan = plan(ci_cd());
    let other = self::plan(fork());
    let mut run = new_run(&other);
    let scheduler = Scheduler::new(ScriptedRunner::with(vec![]), Arc::new(MemoryLedger::new()), options());

    let result = scheduler
        .resume(&plan, &mut run, &RunWorkspaces::new(), &CancelHandle::new())
        .await;
    assert!(matches!(result, Err(PipeflowError::InvalidPipeline { .. })));
}
