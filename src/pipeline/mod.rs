// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Pipeline definitions and types
//!
//! This module defines the pipeline document, the dependency DAG built from
//! it, parameter resolution, validation and the per-run execution plan.

mod dag;
mod definition;
pub mod params;
mod plan;
mod validation;

pub use dag::{Dag, DagBuilder};
pub use definition::*;
pub use params::{ParameterResolver, ResolvedParams};
pub use plan::{ExecutionPlan, PlannedTask};
pub use validation::{PipelineValidator, ValidationReport};
