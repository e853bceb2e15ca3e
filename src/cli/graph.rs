// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Graph command - draw a pipeline's task graph

use miette::Result;
use std::path::PathBuf;

use super::GraphFormat;
use crate::pipeline::DagBuilder;

/// Run the graph command
pub async fn run(pipeline_path: PathBuf, format: GraphFormat, _verbose: bool) -> Result<()> {
    let pipeline = super::load_pipeline(&pipeline_path)?;
    let dag = DagBuilder::build(&pipeline)?;

    let output = match format {
        GraphFormat::Text => dag.to_text(&pipeline),
        GraphFormat::Dot => dag.to_dot(),
        GraphFormat::Mermaid => dag.to_mermaid(),
    };

    print!("{}", output);
    Ok(())
}
