// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Pipeline definition structures
//!
//! Defines the schema for pipeline documents.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::registry::TaskSpec;

/// Pipeline definition loaded from a YAML document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Document version (for future compatibility)
    #[serde(default = "default_version")]
    pub version: String,

    /// Pipeline name
    pub name: String,

    /// Pipeline description
    #[serde(default)]
    pub description: Option<String>,

    /// Declared parameters, in declaration order
    #[serde(default)]
    pub params: Vec<ParamDecl>,

    /// Declared shared workspaces
    #[serde(default)]
    pub workspaces: Vec<WorkspaceDecl>,

    /// Task specs shipped inline with the pipeline
    #[serde(default)]
    pub specs: Vec<TaskSpec>,

    /// Task nodes of the graph
    pub tasks: Vec<TaskNode>,
}

fn default_version() -> String {
    "1".to_string()
}

impl PipelineDefinition {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, crate::PipeflowError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::PipeflowError::FileReadError {
                path: path.to_path_buf(),
                error: e.to_string(),
            }
        })?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, crate::PipeflowError> {
        serde_yaml::from_str(yaml).map_err(Into::into)
    }

    /// Serialize the pipeline to YAML
    pub fn to_yaml(&self) -> Result<String, crate::PipeflowError> {
        serde_yaml::to_string(self).map_err(Into::into)
    }

    /// Get a task node by name
    pub fn get_task(&self, name: &str) -> Option<&TaskNode> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Get a workspace declaration by name
    pub fn get_workspace(&self, name: &str) -> Option<&WorkspaceDecl> {
        self.workspaces.iter().find(|w| w.name == name)
    }

    /// Whether a parameter with this name is declared
    pub fn declares_param(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name)
    }

    /// All task names, in declaration order
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }
}

/// A declared parameter, used both by pipelines and task specs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParamDecl {
    /// Parameter name
    pub name: String,

    /// Value used when the caller supplies none; absent means required
    #[serde(default)]
    pub default: Option<String>,

    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,
}

impl ParamDecl {
    /// A parameter without a default
    pub fn required(name: &str) -> Self {
        Self {
            name: name.to_string(),
            default: None,
            description: None,
        }
    }

    /// A parameter with a default value
    pub fn with_default(name: &str, default: &str) -> Self {
        Self {
            name: name.to_string(),
            default: Some(default.to_string()),
            description: None,
        }
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// A shared workspace declared by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceDecl {
    /// Logical workspace name
    pub name: String,

    /// Workspace description
    #[serde(default)]
    pub description: Option<String>,

    /// Use an existing directory instead of a per-run one
    #[serde(default)]
    pub host_path: Option<PathBuf>,
}

impl WorkspaceDecl {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            host_path: None,
        }
    }
}

/// A node of the task graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    /// Task name (must be unique within the pipeline)
    pub name: String,

    /// Name of the task spec to execute
    #[serde(alias = "taskRef")]
    pub task_ref: String,

    /// Values bound to the spec's parameters; may reference `$(params.X)`
    #[serde(default)]
    pub params: BTreeMap<String, String>,

    /// Spec workspace role → pipeline workspace name
    #[serde(default)]
    pub workspaces: BTreeMap<String, String>,

    /// Tasks that must succeed before this one starts
    #[serde(default, alias = "runAfter")]
    pub run_after: Vec<String>,
}

impl TaskNode {
    /// A node with no bindings or predecessors
    pub fn new(name: &str, task_ref: &str) -> Self {
        Self {
            name: name.to_string(),
            task_ref: task_ref.to_string(),
            params: BTreeMap::new(),
            workspaces: BTreeMap::new(),
            run_after: Vec::new(),
        }
    }

    pub fn after(mut self, predecessors: &[&str]) -> Self {
        self.run_after = predecessors.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn param(mut self, name: &str, value: &str) -> Self {
        self.params.insert(name.to_string(), value.to_string());
        self
    }

    pub fn workspace(mut self, role: &str, workspace: &str) -> Self {
        self.workspaces.insert(role.to_string(), workspace.to_string());
        self
    }
}
