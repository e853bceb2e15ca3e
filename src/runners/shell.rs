// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Shell runner
//!
//! Executes task bodies as host processes.

use async_trait::async_trait;
use tokio::process::Command;

use super::{run_command, TaskInvocation, TaskOutput, TaskRunner};
use crate::errors::PipeflowError;
use crate::run::CancelSignal;

/// Shell runner
pub struct ShellRunner {
    /// Shell used for `script` bodies
    shell: String,
}

impl ShellRunner {
    /// Create a new shell runner
    pub fn new(shell: &str) -> Self {
        Self {
            shell: shell.to_string(),
        }
    }

    /// Build the host command for an invocation
    fn build_command(&self, invocation: &TaskInvocation) -> Result<(Command, String), PipeflowError> {
        let (mut cmd, program) = if let Some(ref script) = invocation.script {
            let mut cmd = Command::new(&self.shell);
            // Args become $1.. of the script
            cmd.arg("-c").arg(script).arg(&invocation.task);
            cmd.args(&invocation.args);
            (cmd, self.shell.clone())
        } else {
            let (program, fixed) = invocation.command.split_first().ok_or_else(|| {
                PipeflowError::invalid_pipeline(format!(
                    "task '{}' has neither a script nor a command",
                    invocation.task
                ))
            })?;
            let mut cmd = Command::new(program);
            cmd.args(fixed).args(&invocation.args);
            (cmd, program.clone())
        };

        if let Some(dir) = invocation.working_dir() {
            cmd.current_dir(dir);
        }
        cmd.envs(&invocation.env);
        cmd.envs(invocation.engine_env());

        Ok((cmd, program))
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("bash")
    }
}

#[async_trait]
impl TaskRunner for ShellRunner {
    async fn run(
        &self,
        invocation: &TaskInvocation,
        cancel: CancelSignal,
    ) -> Result<TaskOutput, PipeflowError> {
        let (cmd, program) = self.build_command(invocation)?;
        run_command(cmd, &program, cancel).await
    }

    async fn check_available(&self) -> Result<bool, PipeflowError> {
        Ok(which::which(&self.shell).is_ok())
    }

    fn name(&self) -> &str {
        "shell"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{CancelHandle, RunId};
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn invocation(script: &str) -> TaskInvocation {
        TaskInvocation {
            run_id: RunId::new(),
            task: "test".into(),
            spec: "script".into(),
            attempt: 1,
            image: None,
            command: vec![],
            args: vec![],
            script: Some(script.into()),
            env: BTreeMap::new(),
            workspaces: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_execute_simple_script() {
        let runner = ShellRunner::new("sh");
        let result = runner
            .run(&invocation("echo hello"), CancelSignal::never())
            .await
            .unwrap();

        assert!(result.success());
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let runner = ShellRunner::new("sh");
        let result = runner
            .run(&invocation("echo broken >&2; exit 3"), CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(result.exit_code, 3);
        assert!(result.stderr.contains("broken"));
    }

    #[tokio::test]
    async fn test_command_args_and_workspace_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = invocation("");
        inv.script = None;
        inv.command = vec!["sh".into(), "-c".into()];
        inv.args = vec!["pwd; echo $GREETING".into()];
        inv.env.insert("GREETING".into(), "hi".into());
        inv.workspaces.insert("source".into(), PathBuf::from(dir.path()));

        let result = ShellRunner::new("sh").run(&inv, CancelSignal::never()).await.unwrap();

        assert!(result.success());
        let canonical = dir.path().canonicalize().unwrap();
        let name = canonical.file_name().unwrap().to_string_lossy().to_string();
        assert!(result.stdout.contains(&name));
        assert!(result.stdout.contains("hi"));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let handle = CancelHandle::new();
        let signal = handle.signal();
        let runner = ShellRunner::new("sh");

        let task = tokio::spawn(async move { runner.run(&invocation("sleep 30"), signal).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("runner should stop promptly")
            .unwrap()
            .unwrap();
        assert!(result.interrupted);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let mut inv = invocation("");
        inv.script = None;
        inv.command = vec!["definitely-not-a-real-binary-pipeflow".into()];

        let result = ShellRunner::new("sh").run(&inv, CancelSignal::never()).await;
        assert!(matches!(result, Err(PipeflowError::RunnerUnavailable { .. })));
    }
}
