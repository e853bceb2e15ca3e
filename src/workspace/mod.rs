// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Workspace store
//!
//! Each run gets its own directory per declared workspace under
//! `<root>/<run-id>/<workspace>`. Tasks that bind the same workspace see the
//! same directory; ordering writers is the pipeline author's job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::errors::PipeflowError;
use crate::pipeline::WorkspaceDecl;
use crate::run::RunId;

/// Workspace name → directory, for one run
pub type RunWorkspaces = HashMap<String, PathBuf>;

/// Allocates and releases per-run workspace directories
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
    /// Keep directories after the run finishes
    retain: bool,
}

impl WorkspaceStore {
    pub fn new(root: impl Into<PathBuf>, retain: bool) -> Self {
        Self {
            root: root.into(),
            retain,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory that holds every workspace of a run
    pub fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    /// Create (or reuse, on resume) the directories for a run
    pub async fn allocate(
        &self,
        run_id: RunId,
        decls: &[WorkspaceDecl],
    ) -> Result<RunWorkspaces, PipeflowError> {
        let run_dir = self.run_dir(run_id);
        let mut dirs = RunWorkspaces::with_capacity(decls.len());

        for decl in decls {
            let dir = match decl.host_path {
                Some(ref host) => host.clone(),
                None => run_dir.join(&decl.name),
            };

            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| PipeflowError::WorkspaceUnavailable {
                    workspace: decl.name.clone(),
                    path: dir.clone(),
                    error: e.to_string(),
                })?;

            // Absolute paths survive a task changing directory
            let dir = dir.canonicalize().unwrap_or(dir);
            debug!("Workspace '{}' at {}", decl.name, dir.display());
            dirs.insert(decl.name.clone(), dir);
        }

        Ok(dirs)
    }

    /// Remove a run's directories unless the store retains them
    ///
    /// Declared `host_path` directories are never removed.
    pub async fn release(&self, run_id: RunId) -> Result<(), PipeflowError> {
        if self.retain {
            debug!("Retaining workspaces of run {}", run_id);
            return Ok(());
        }

        let run_dir = self.run_dir(run_id);
        if !run_dir.exists() {
            return Ok(());
        }

        if let Err(e) = tokio::fs::remove_dir_all(&run_dir).await {
            warn!("Failed to remove workspaces at {}: {}", run_dir.display(), e);
            return Err(PipeflowError::WorkspaceUnavailable {
                workspace: run_id.to_string(),
                path: run_dir,
                error: e.to_string(),
            });
        }
        Ok(())
    }
}
