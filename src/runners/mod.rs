// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Task runners
//!
//! The engine treats task bodies as black boxes: a [`TaskRunner`] receives a
//! fully bound [`TaskInvocation`] and reports an exit code plus captured
//! output. `Err` from a runner means the task could not be executed at all
//! and is handled as an infrastructure error.

mod container;
mod shell;

pub use container::ContainerRunner;
pub use shell::ShellRunner;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

use crate::errors::PipeflowError;
use crate::run::{CancelSignal, RunId};

/// Everything a runner needs to execute one attempt of a task
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub run_id: RunId,
    pub task: String,
    pub spec: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub image: Option<String>,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub script: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Workspace role → directory
    pub workspaces: BTreeMap<String, PathBuf>,
}

impl TaskInvocation {
    /// Directory the task starts in: the first bound workspace
    pub fn working_dir(&self) -> Option<&Path> {
        self.workspaces.values().next().map(PathBuf::as_path)
    }

    /// Engine-provided environment variables
    pub fn engine_env(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("PIPEFLOW_RUN_ID".to_string(), self.run_id.to_string()),
            ("PIPEFLOW_TASK".to_string(), self.task.clone()),
            ("PIPEFLOW_ATTEMPT".to_string(), self.attempt.to_string()),
        ];
        for (role, dir) in &self.workspaces {
            vars.push((
                format!("PIPEFLOW_WORKSPACE_{}", env_key(role)),
                dir.display().to_string(),
            ));
        }
        vars
    }
}

fn env_key(role: &str) -> String {
    role.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// What a task body produced
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// The process was killed because the run was cancelled
    pub interrupted: bool,
}

impl TaskOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.interrupted
    }

    /// Combined output as stored in the ledger
    pub fn log_text(&self) -> String {
        let mut text = String::new();
        if !self.stdout.is_empty() {
            text.push_str(&self.stdout);
            if !self.stdout.ends_with('\n') {
                text.push('\n');
            }
        }
        if !self.stderr.is_empty() {
            text.push_str("--- stderr ---\n");
            text.push_str(&self.stderr);
        }
        text
    }

    fn interrupted(duration: Duration) -> Self {
        Self {
            exit_code: 130,
            stdout: String::new(),
            stderr: String::new(),
            duration,
            interrupted: true,
        }
    }
}

/// Trait for task runners
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Execute one attempt; the runner must stop the task when `cancel` fires
    async fn run(
        &self,
        invocation: &TaskInvocation,
        cancel: CancelSignal,
    ) -> Result<TaskOutput, PipeflowError>;

    /// Check that the runner can execute anything at all
    async fn check_available(&self) -> Result<bool, PipeflowError>;

    /// Runner name, for logs
    fn name(&self) -> &str;
}

/// Which runner executes tasks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    /// Container runner for specs with an image, shell otherwise
    #[default]
    Auto,
    Shell,
    Container,
}

impl std::str::FromStr for RunnerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "shell" => Ok(Self::Shell),
            "container" => Ok(Self::Container),
            _ => Err(format!("Unknown runner: {}", s)),
        }
    }
}

/// Runs image-based specs in containers when a runtime exists
pub struct AutoRunner {
    shell: ShellRunner,
    container: Option<ContainerRunner>,
}

impl AutoRunner {
    pub fn new(shell: &str) -> Self {
        Self {
            shell: ShellRunner::new(shell),
            container: ContainerRunner::detect(shell).ok(),
        }
    }
}

#[async_trait]
impl TaskRunner for AutoRunner {
    async fn run(
        &self,
        invocation: &TaskInvocation,
        cancel: CancelSignal,
    ) -> Result<TaskOutput, PipeflowError> {
        match (&invocation.image, &self.container) {
            (Some(_), Some(container)) => container.run(invocation, cancel).await,
            (Some(image), None) => {
                debug!(
                    "No container runtime; running '{}' on the host instead of {}",
                    invocation.task, image
                );
                self.shell.run(invocation, cancel).await
            }
            (None, _) => self.shell.run(invocation, cancel).await,
        }
    }

    async fn check_available(&self) -> Result<bool, PipeflowError> {
        self.shell.check_available().await
    }

    fn name(&self) -> &str {
        "auto"
    }
}

/// Create the runner selected by configuration
pub fn create_runner(kind: RunnerKind, shell: &str) -> Result<Arc<dyn TaskRunner>, PipeflowError> {
    Ok(match kind {
        RunnerKind::Auto => Arc::new(AutoRunner::new(shell)),
        RunnerKind::Shell => Arc::new(ShellRunner::new(shell)),
        RunnerKind::Container => Arc::new(ContainerRunner::detect(shell)?),
    })
}

/// Run a prepared command to completion, killing it if `cancel` fires
pub(crate) async fn run_command(
    mut cmd: Command,
    program: &str,
    mut cancel: CancelSignal,
) -> Result<TaskOutput, PipeflowError> {
    cmd.kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let start = Instant::now();
    let output = tokio::select! {
        output = cmd.output() => output.map_err(|e| PipeflowError::RunnerUnavailable {
            runner: program.to_string(),
            error: e.to_string(),
        })?,
        _ = cancel.cancelled() => return Ok(TaskOutput::interrupted(start.elapsed())),
    };

    Ok(TaskOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration: start.elapsed(),
        interrupted: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_env_names_workspaces() {
        let invocation = TaskInvocation {
            run_id: RunId::new(),
            task: "build".into(),
            spec: "make".into(),
            attempt: 2,
            image: None,
            command: vec![],
            args: vec![],
            script: Some("make".into()),
            env: BTreeMap::new(),
            workspaces: BTreeMap::from([("shared-data".to_string(), PathBuf::from("/ws/data"))]),
        };

        let env = invocation.engine_env();
        assert!(env.contains(&("PIPEFLOW_WORKSPACE_SHARED_DATA".into(), "/ws/data".into())));
        assert!(env.contains(&("PIPEFLOW_ATTEMPT".into(), "2".into())));
    }

    #[test]
    fn test_log_text_separates_stderr() {
        let output = TaskOutput {
            exit_code: 1,
            stdout: "building".into(),
            stderr: "boom".into(),
            duration: Duration::from_millis(5),
            interrupted: false,
        };
        assert_eq!(output.log_text(), "building\n--- stderr ---\nboom");
        assert!(!output.success());
    }

    #[test]
    fn test_parse_runner_kind() {
        assert_eq!("Shell".parse::<RunnerKind>().unwrap(), RunnerKind::Shell);
        assert!("k8s".parse::<RunnerKind>().is_err());
    }
}
