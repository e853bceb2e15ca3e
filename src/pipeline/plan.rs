// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Execution plans
//!
//! A plan is a pipeline with its parameters resolved: every task node joined
//! with its spec and every `$(params.*)` token substituted. Workspace paths
//! and run context are bound later, once per run.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::PipeflowError;
use crate::pipeline::params::{substitute, ParameterResolver, ResolvedParams, Scope};
use crate::pipeline::{Dag, DagBuilder, PipelineDefinition, TaskNode};
use crate::registry::{RetryPolicy, TaskRegistry, TaskSpec};
use crate::run::RunId;
use crate::runners::TaskInvocation;

/// A task ready to be turned into invocations
#[derive(Debug, Clone)]
pub struct PlannedTask {
    pub name: String,
    pub spec: String,
    pub image: Option<String>,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub script: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Spec workspace role → pipeline workspace name
    pub workspaces: BTreeMap<String, String>,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
}

impl PlannedTask {
    fn build(
        node: &TaskNode,
        spec: &TaskSpec,
        pipeline_params: &ResolvedParams,
    ) -> Result<Self, PipeflowError> {
        let pipeline_scope = Scope::params(pipeline_params.as_map());

        // Node bindings see pipeline params
        let mut task_params = BTreeMap::new();
        for (key, value) in &node.params {
            if spec.param(key).is_none() {
                return Err(PipeflowError::InvalidPipeline {
                    reason: format!(
                        "task '{}' binds parameter '{}' which spec '{}' does not declare",
                        node.name, key, spec.name
                    ),
                    help: None,
                });
            }
            let location = format!("{}.params.{}", node.name, key);
            task_params.insert(key.clone(), substitute(value, &pipeline_scope, &location)?);
        }

        for decl in &spec.params {
            if task_params.contains_key(&decl.name) {
                continue;
            }
            let value = decl.default.clone().ok_or_else(|| {
                PipeflowError::MissingRequiredParameter {
                    param: format!("{}.{}", node.name, decl.name),
                }
            })?;
            task_params.insert(decl.name.clone(), value);
        }

        // Spec templates see the spec's own params
        let task_scope = Scope::params(&task_params);
        let at = |label: &str| format!("{}.{}", node.name, label);

        let args = spec
            .args
            .iter()
            .enumerate()
            .map(|(i, arg)| substitute(arg, &task_scope, &at(&format!("args[{}]", i))))
            .collect::<Result<Vec<_>, _>>()?;

        let script = spec
            .script
            .as_deref()
            .map(|s| substitute(s, &task_scope, &at("script")))
            .transpose()?;

        let env = spec
            .env
            .iter()
            .map(|(k, v)| Ok((k.clone(), substitute(v, &task_scope, &at(&format!("env.{}", k)))?)))
            .collect::<Result<BTreeMap<_, _>, PipeflowError>>()?;

        for role in &spec.workspaces {
            if !node.workspaces.contains_key(role) {
                return Err(PipeflowError::MissingWorkspaceBinding {
                    task: node.name.clone(),
                    role: role.clone(),
                });
            }
        }

        Ok(Self {
            name: node.name.clone(),
            spec: spec.name.clone(),
            image: spec.image.clone(),
            command: spec.command.clone(),
            args,
            script,
            env,
            workspaces: node.workspaces.clone(),
            retry: spec.retry.clone(),
            timeout: spec.timeout(),
        })
    }

    /// Bind workspace directories and run context for one attempt
    pub fn invocation(
        &self,
        run_id: RunId,
        pipeline: &str,
        workspace_dirs: &HashMap<String, PathBuf>,
        attempt: u32,
    ) -> Result<TaskInvocation, PipeflowError> {
        let mut roles = BTreeMap::new();
        let mut role_paths = BTreeMap::new();
        for (role, workspace) in &self.workspaces {
            let dir = workspace_dirs.get(workspace).ok_or_else(|| {
                PipeflowError::UnknownWorkspace {
                    task: self.name.clone(),
                    workspace: workspace.clone(),
                }
            })?;
            role_paths.insert(role.clone(), dir.display().to_string());
            roles.insert(role.clone(), dir.clone());
        }

        let context = BTreeMap::from([
            ("run.id".to_string(), run_id.to_string()),
            ("pipeline.name".to_string(), pipeline.to_string()),
        ]);
        let scope = Scope {
            params: None,
            workspaces: Some(&role_paths),
            context: Some(&context),
        };
        let at = |label: &str| format!("{}.{}", self.name, label);

        Ok(TaskInvocation {
            run_id,
            task: self.name.clone(),
            spec: self.spec.clone(),
            attempt,
            image: self.image.clone(),
            command: self.command.clone(),
            args: self
                .args
                .iter()
                .map(|a| substitute(a, &scope, &at("args")))
                .collect::<Result<_, _>>()?,
            script: self
                .script
                .as_deref()
                .map(|s| substitute(s, &scope, &at("script")))
                .transpose()?,
            env: self
                .env
                .iter()
                .map(|(k, v)| Ok((k.clone(), substitute(v, &scope, &at("env"))?)))
                .collect::<Result<_, PipeflowError>>()?,
            workspaces: roles,
        })
    }
}

/// A pipeline bound to concrete parameter values
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub pipeline: Arc<PipelineDefinition>,
    pub dag: Dag,
    pub params: ResolvedParams,
    /// Indexed like the DAG (declaration order)
    pub tasks: Vec<PlannedTask>,
}

impl ExecutionPlan {
    /// Resolve overrides and build the plan
    pub fn build(
        pipeline: Arc<PipelineDefinition>,
        registry: &TaskRegistry,
        overrides: &HashMap<String, String>,
    ) -> Result<Self, PipeflowError> {
        let params = ParameterResolver::resolve(&pipeline.params, overrides)?;
        Self::with_params(pipeline, registry, params)
    }

    /// Build the plan from already-resolved parameters
    pub fn with_params(
        pipeline: Arc<PipelineDefinition>,
        registry: &TaskRegistry,
        params: ResolvedParams,
    ) -> Result<Self, PipeflowError> {
        let dag = DagBuilder::build(&pipeline)?;

        let tasks = pipeline
            .tasks
            .iter()
            .map(|node| {
                let spec = registry.get(&node.task_ref).ok_or_else(|| {
                    PipeflowError::UnknownTaskSpec {
                        task: node.name.clone(),
                        spec: node.task_ref.clone(),
                    }
                })?;
                PlannedTask::build(node, spec, &params)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            pipeline,
            dag,
            params,
            tasks,
        })
    }

    pub fn task(&self, name: &str) -> Option<&PlannedTask> {
        self.dag.index_of(name).map(|i| &self.tasks[i])
    }
}
