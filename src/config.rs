// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Engine configuration
//!
//! Loaded from `pipeflow.toml`. Lookup order: an explicit `--config` path,
//! `./pipeflow.toml`, then the user config directory. Missing files mean
//! defaults; command-line flags override whatever was loaded.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::errors::PipeflowError;
use crate::runners::RunnerKind;
use crate::scheduler::SchedulerOptions;
use crate::workspace::WorkspaceStore;

pub const CONFIG_FILE: &str = "pipeflow.toml";

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum tasks running at once
    pub concurrency: usize,

    /// Stop dispatching after the first task failure
    pub fail_fast: bool,

    /// Seconds running tasks get to stop after cancellation
    pub cancel_timeout_secs: u64,

    /// Retries for runner errors
    pub infra_retries: u32,

    /// First delay between runner-error retries
    pub infra_backoff_ms: u64,

    /// Where run ledgers are written
    pub ledger_dir: PathBuf,

    /// Root of per-run workspace directories
    pub workspace_root: PathBuf,

    /// Keep workspace directories after a run
    pub retain_workspaces: bool,

    /// Directory of task spec files loaded into the registry
    pub specs_dir: PathBuf,

    pub runner: RunnerKind,

    /// Shell for `script` task bodies
    pub shell: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            fail_fast: true,
            cancel_timeout_secs: 30,
            infra_retries: 3,
            infra_backoff_ms: 500,
            ledger_dir: PathBuf::from(".pipeflow/runs"),
            workspace_root: PathBuf::from(".pipeflow/workspaces"),
            retain_workspaces: false,
            specs_dir: PathBuf::from("specs"),
            runner: RunnerKind::Auto,
            shell: "bash".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration, falling back to defaults when no file exists
    pub fn load(explicit: Option<&Path>) -> Result<Self, PipeflowError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return Self::from_file(&local);
        }

        if let Some(user) = Self::user_config_path() {
            if user.exists() {
                return Self::from_file(&user);
            }
        }

        debug!("No {} found, using defaults", CONFIG_FILE);
        Ok(Self::default())
    }

    /// Parse a config file
    pub fn from_file(path: &Path) -> Result<Self, PipeflowError> {
        let content = std::fs::read_to_string(path).map_err(|e| PipeflowError::FileReadError {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        debug!("Loaded config from {}", path.display());
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, PipeflowError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// `pipeflow.toml` in the platform's user config directory
    pub fn user_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "pipeflow")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    fn validate(&self) -> Result<(), PipeflowError> {
        if self.concurrency == 0 {
            return Err(PipeflowError::InvalidPipeline {
                reason: "concurrency must be at least 1".to_string(),
                help: Some(format!("Set concurrency in {}", CONFIG_FILE)),
            });
        }
        if self.shell.trim().is_empty() {
            return Err(PipeflowError::invalid_pipeline("shell must not be empty"));
        }
        Ok(())
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            concurrency: self.concurrency.max(1),
            fail_fast: self.fail_fast,
            cancel_timeout: Duration::from_secs(self.cancel_timeout_secs),
            infra_retries: self.infra_retries,
            infra_backoff: Duration::from_millis(self.infra_backoff_ms),
        }
    }

    pub fn workspace_store(&self) -> WorkspaceStore {
        WorkspaceStore::new(&self.workspace_root, self.retain_workspaces)
    }
}
