// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Container runner
//!
//! Executes task bodies with `docker run` or `podman run`. Workspace
//! directories are mounted at their host paths so `$(workspaces.*.path)`
//! means the same thing inside and outside the container.
//!
//! Killing the `docker run` client does not stop the container, so an
//! attempt that is cancelled or dropped on timeout stops its container by
//! name: `stop` first, `kill` if that fails.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{run_command, TaskInvocation, TaskOutput, TaskRunner};
use crate::errors::PipeflowError;
use crate::run::CancelSignal;

const RUNTIMES: [&str; 2] = ["docker", "podman"];

/// Seconds `stop` waits after SIGTERM before the runtime kills the container
const STOP_GRACE_SECS: u32 = 10;

/// Container runner
pub struct ContainerRunner {
    /// Path to the container runtime binary
    runtime_bin: PathBuf,
    runtime: String,
    /// Shell used for `script` bodies inside the image
    shell: String,
}

impl ContainerRunner {
    /// Find docker or podman on PATH
    pub fn detect(shell: &str) -> Result<Self, PipeflowError> {
        RUNTIMES
            .iter()
            .find_map(|name| Self::with_runtime(name, shell).ok())
            .ok_or_else(|| PipeflowError::RunnerUnavailable {
                runner: "container".to_string(),
                error: "neither docker nor podman found in PATH".to_string(),
            })
    }

    /// Use a specific runtime
    pub fn with_runtime(runtime: &str, shell: &str) -> Result<Self, PipeflowError> {
        let runtime_bin = which::which(runtime).map_err(|e| PipeflowError::RunnerUnavailable {
            runner: runtime.to_string(),
            error: e.to_string(),
        })?;

        Ok(Self {
            runtime_bin,
            runtime: runtime.to_string(),
            shell: shell.to_string(),
        })
    }

    /// Build the `<runtime> run` command for an invocation
    fn build_command(&self, invocation: &TaskInvocation) -> Result<Command, PipeflowError> {
        let image = invocation.image.as_deref().ok_or_else(|| {
            PipeflowError::invalid_pipeline(format!(
                "task '{}' has no image for the container runner",
                invocation.task
            ))
        })?;

        let mut cmd = Command::new(&self.runtime_bin);
        cmd.args(self.run_args(invocation, image)?);
        Ok(cmd)
    }

    fn run_args(&self, invocation: &TaskInvocation, image: &str) -> Result<Vec<String>, PipeflowError> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name(invocation),
        ];

        for dir in invocation.workspaces.values() {
            let path = dir.display();
            args.push("-v".into());
            args.push(format!("{}:{}", path, path));
        }
        if let Some(dir) = invocation.working_dir() {
            args.push("-w".into());
            args.push(dir.display().to_string());
        }

        let env = invocation
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(invocation.engine_env());
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }

        if let Some(ref script) = invocation.script {
            args.push("--entrypoint".into());
            args.push(self.shell.clone());
            args.push(image.to_string());
            args.push("-c".into());
            args.push(script.clone());
            args.push(invocation.task.clone());
        } else {
            let (entrypoint, fixed) = invocation.command.split_first().ok_or_else(|| {
                PipeflowError::invalid_pipeline(format!(
                    "task '{}' has neither a script nor a command",
                    invocation.task
                ))
            })?;
            args.push("--entrypoint".into());
            args.push(entrypoint.clone());
            args.push(image.to_string());
            args.extend(fixed.iter().cloned());
        }
        args.extend(invocation.args.iter().cloned());

        Ok(args)
    }
}

#[async_trait]
impl TaskRunner for ContainerRunner {
    async fn run(
        &self,
        invocation: &TaskInvocation,
        cancel: CancelSignal,
    ) -> Result<TaskOutput, PipeflowError> {
        let cmd = self.build_command(invocation)?;
        let mut guard = StopOnDrop {
            runtime_bin: self.runtime_bin.clone(),
            name: container_name(invocation),
            armed: true,
        };

        let result = run_command(cmd, &self.runtime, cancel).await;
        guard.armed = false;
        if matches!(result, Ok(ref output) if output.interrupted) {
            stop_container(&self.runtime_bin, &guard.name).await;
        }
        result
    }

    async fn check_available(&self) -> Result<bool, PipeflowError> {
        let status = Command::new(&self.runtime_bin)
            .arg("version")
            .output()
            .await
            .map_err(|e| PipeflowError::RunnerUnavailable {
                runner: self.runtime.clone(),
                error: e.to_string(),
            })?;
        Ok(status.status.success())
    }

    fn name(&self) -> &str {
        &self.runtime
    }
}

fn container_name(invocation: &TaskInvocation) -> String {
    format!("pipeflow-{}-{}-{}", invocation.run_id, invocation.task, invocation.attempt)
}

fn stop_args(name: &str) -> Vec<String> {
    vec![
        "stop".to_string(),
        "-t".to_string(),
        STOP_GRACE_SECS.to_string(),
        name.to_string(),
    ]
}

fn kill_args(name: &str) -> Vec<String> {
    vec!["kill".to_string(), name.to_string()]
}

/// Stop a container, falling back to kill
async fn stop_container(runtime_bin: &Path, name: &str) {
    if runtime_succeeds(runtime_bin, &stop_args(name)).await {
        debug!("Stopped container {}", name);
        return;
    }
    if !runtime_succeeds(runtime_bin, &kill_args(name)).await {
        // Also the case when the container never started
        warn!("Could not stop container {}", name);
    }
}

async fn runtime_succeeds(runtime_bin: &Path, args: &[String]) -> bool {
    Command::new(runtime_bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Stops the container when an attempt is dropped mid-run, as on timeout
struct StopOnDrop {
    runtime_bin: PathBuf,
    name: String,
    armed: bool,
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to stop container {}", self.name);
            return;
        };
        let runtime_bin = std::mem::take(&mut self.runtime_bin);
        let name = std::mem::take(&mut self.name);
        handle.spawn(async move { stop_container(&runtime_bin, &name).await });
    }
}
