// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Validate command - check a pipeline definition without running it

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;
use std::sync::Arc;

use crate::pipeline::{ExecutionPlan, ParameterResolver, PipelineValidator};
use crate::registry::TaskRegistry;

/// Run the validate command
///
/// With `-p` overrides the parameters are resolved too, which catches
/// missing required parameters and unresolved references.
pub async fn run(
    pipeline_path: PathBuf,
    params: Vec<String>,
    specs: Option<PathBuf>,
    config_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    println!("{}", "Validating pipeline...".bold());
    println!();

    let config = super::load_config(config_path.as_deref(), specs)?;
    let pipeline = match super::load_pipeline(&pipeline_path) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("  {} Failed to parse pipeline", "✗".red());
            eprintln!();
            return Err(e.into());
        }
    };
    println!("  {} Pipeline file is valid YAML", "✓".green());

    let mut registry = TaskRegistry::new();
    if config.specs_dir.is_dir() {
        let loaded = registry.load_dir(&config.specs_dir)?;
        println!(
            "  {} Loaded {} task specs from {}",
            "✓".green(),
            loaded,
            config.specs_dir.display()
        );
    }
    registry.extend(pipeline.specs.iter().cloned());

    let mut validation = PipelineValidator::validate(&pipeline, &registry);

    if validation.is_valid() && !params.is_empty() {
        let overrides = ParameterResolver::parse_overrides(&params)?;
        match ExecutionPlan::build(Arc::new(pipeline.clone()), &registry, &overrides) {
            Ok(_) => println!("  {} Parameters resolve", "✓".green()),
            Err(e) => validation.add_error(e),
        }
    }

    if !validation.errors.is_empty() {
        println!();
        println!("{}:", "Errors".red().bold());
        for error in &validation.errors {
            println!("  {} {}", "✗".red(), error);
        }
    }

    if validation.has_warnings() {
        println!();
        println!("{}:", "Warnings".yellow().bold());
        for warning in &validation.warnings {
            println!("  {} {}", "⚠".yellow(), warning);
        }
    }

    if verbose {
        println!();
        println!("{}:", "Pipeline summary".bold());
        println!("  Name: {}", pipeline.name);
        println!("  Tasks: {}", pipeline.tasks.len());
        for task in &pipeline.tasks {
            let deps = if task.run_after.is_empty() {
                String::new()
            } else {
                format!(" [after: {}]", task.run_after.join(", "))
            };
            println!("    - {} ({}){}", task.name, task.task_ref, deps.dimmed());
        }
    }

    println!();

    if validation.is_valid() {
        if validation.has_warnings() {
            println!("{}", "Pipeline is valid but has warnings.".yellow().bold());
        } else {
            println!("{}", "Pipeline is valid!".green().bold());
        }
    }

    // The first error decides the exit code
    validation.into_result()?;
    Ok(())
}
