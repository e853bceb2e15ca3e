// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Pipeline validation
//!
//! Validates a pipeline against the task registry before anything runs.
//! Unlike the DAG builder, the validator keeps going after the first problem
//! so a user sees every error in one pass.

use std::collections::HashSet;

use crate::errors::PipeflowError;
use crate::pipeline::params::{references, Reference};
use crate::pipeline::{DagBuilder, PipelineDefinition, TaskNode};
use crate::registry::{TaskRegistry, TaskSpec};

/// Pipeline validator
pub struct PipelineValidator;

impl PipelineValidator {
    /// Validate a pipeline definition
    pub fn validate(pipeline: &PipelineDefinition, registry: &TaskRegistry) -> ValidationReport {
        let mut report = ValidationReport::new();

        // Graph shape: duplicates, unknown run_after, cycles
        if let Err(e) = DagBuilder::build(pipeline) {
            report.add_error(e);
        }

        let mut bound_workspaces = HashSet::new();
        let mut used_params: HashSet<String> = HashSet::new();

        for node in &pipeline.tasks {
            for workspace in node.workspaces.values() {
                bound_workspaces.insert(workspace.as_str());
            }

            match registry.get(&node.task_ref) {
                Some(spec) => {
                    Self::validate_node(node, spec, pipeline, &mut used_params, &mut report)
                }
                None => report.add_error(PipeflowError::UnknownTaskSpec {
                    task: node.name.clone(),
                    spec: node.task_ref.clone(),
                }),
            }
        }

        let mut checked_specs = HashSet::new();
        for node in &pipeline.tasks {
            if let Some(spec) = registry.get(&node.task_ref) {
                if checked_specs.insert(spec.name.as_str()) {
                    Self::validate_spec(spec, &mut report);
                }
            }
        }

        for workspace in &pipeline.workspaces {
            if !bound_workspaces.contains(workspace.name.as_str()) {
                report.add_warning(format!(
                    "Workspace '{}' is declared but no task binds it",
                    workspace.name
                ));
            }
        }

        for param in &pipeline.params {
            if !used_params.contains(param.name.as_str()) {
                report.add_warning(format!(
                    "Parameter '{}' is declared but never referenced",
                    param.name
                ));
            }
        }

        report
    }

    /// Check a node's bindings against its spec and the pipeline
    fn validate_node(
        node: &TaskNode,
        spec: &TaskSpec,
        pipeline: &PipelineDefinition,
        used_params: &mut HashSet<String>,
        report: &mut ValidationReport,
    ) {
        for (key, value) in &node.params {
            if spec.param(key).is_none() {
                report.add_error(PipeflowError::InvalidPipeline {
                    reason: format!(
                        "task '{}' binds parameter '{}' which spec '{}' does not declare",
                        node.name, key, spec.name
                    ),
                    help: None,
                });
            }

            for reference in references(value) {
                match reference {
                    Reference::Param(name) if pipeline.declares_param(&name) => {
                        used_params.insert(name);
                    }
                    Reference::Context(_) => {}
                    Reference::Param(name) => report.add_error(unresolved(
                        format!("params.{}", name),
                        format!("{}.params.{}", node.name, key),
                    )),
                    Reference::WorkspacePath(name) => report.add_error(unresolved(
                        format!("workspaces.{}.path", name),
                        format!("{}.params.{}", node.name, key),
                    )),
                    Reference::Malformed(raw) => {
                        report.add_error(unresolved(raw, format!("{}.params.{}", node.name, key)))
                    }
                }
            }
        }

        for decl in &spec.params {
            if decl.is_required() && !node.params.contains_key(&decl.name) {
                report.add_error(PipeflowError::MissingRequiredParameter {
                    param: format!("{}.{}", node.name, decl.name),
                });
            }
        }

        for (role, workspace) in &node.workspaces {
            if !spec.declares_workspace(role) {
                report.add_error(PipeflowError::InvalidPipeline {
                    reason: format!(
                        "task '{}' binds workspace role '{}' which spec '{}' does not declare",
                        node.name, role, spec.name
                    ),
                    help: None,
                });
            }
            if pipeline.get_workspace(workspace).is_none() {
                report.add_error(PipeflowError::UnknownWorkspace {
                    task: node.name.clone(),
                    workspace: workspace.clone(),
                });
            }
        }

        for role in &spec.workspaces {
            if !node.workspaces.contains_key(role) {
                report.add_error(PipeflowError::MissingWorkspaceBinding {
                    task: node.name.clone(),
                    role: role.clone(),
                });
            }
        }
    }

    /// Check a spec's own templates
    fn validate_spec(spec: &TaskSpec, report: &mut ValidationReport) {
        if spec.script.is_none() && spec.command.is_empty() {
            report.add_error(PipeflowError::InvalidPipeline {
                reason: format!("spec '{}' has neither a script nor a command", spec.name),
                help: Some("Set 'script' or 'command' on the spec".into()),
            });
        }

        for (label, template) in spec.templates() {
            let location = format!("{}.{}", spec.name, label);
            for reference in references(template) {
                match reference {
                    Reference::Param(name) if spec.param(&name).is_none() => {
                        report.add_error(unresolved(format!("params.{}", name), location.clone()))
                    }
                    Reference::WorkspacePath(name) if !spec.declares_workspace(&name) => report
                        .add_error(unresolved(
                            format!("workspaces.{}.path", name),
                            location.clone(),
                        )),
                    Reference::Malformed(raw) => report.add_error(unresolved(raw, location.clone())),
                    _ => {}
                }
            }
        }
    }
}

fn unresolved(reference: String, location: String) -> PipeflowError {
    PipeflowError::UnresolvedReference {
        reference,
        location,
    }
}

/// Result of pipeline validation
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<PipeflowError>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: PipeflowError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, message: String) {
        self.warnings.push(message);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// The first error, if any, as a typed failure
    pub fn into_result(mut self) -> Result<Vec<String>, PipeflowError> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(self.errors.swap_remove(0))
        }
    }
}
