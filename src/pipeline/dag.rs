// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! DAG (Directed Acyclic Graph) builder for task dependencies
//!
//! Builds and validates the dependency graph of a pipeline. Tasks are stored
//! in an arena indexed by declaration order; predecessor and successor lists
//! are precomputed so the scheduler never walks the petgraph structure.

use petgraph::algo::{has_path_connecting, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::errors::PipeflowError;
use crate::pipeline::PipelineDefinition;

/// Validated task dependency graph
#[derive(Debug, Clone)]
pub struct Dag {
    graph: DiGraph<usize, ()>,
    names: Vec<String>,
    name_to_index: HashMap<String, usize>,
    predecessors: Vec<Vec<usize>>,
    successors: Vec<Vec<usize>>,
    order: Vec<usize>,
}

/// Builder for task dependency DAGs
pub struct DagBuilder;

impl DagBuilder {
    /// Build a DAG from a pipeline definition
    pub fn build(pipeline: &PipelineDefinition) -> Result<Dag, PipeflowError> {
        if pipeline.tasks.is_empty() {
            return Err(PipeflowError::invalid_pipeline("pipeline has no tasks"));
        }

        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();
        let mut names = Vec::with_capacity(pipeline.tasks.len());

        // Add all tasks as nodes
        for (idx, task) in pipeline.tasks.iter().enumerate() {
            if !is_valid_task_name(&task.name) {
                return Err(PipeflowError::invalid_pipeline(format!(
                    "task name '{}' must start with a letter or digit and contain only letters, digits, '-', '_' or '.'",
                    task.name
                )));
            }
            if name_to_index.insert(task.name.clone(), idx).is_some() {
                return Err(PipeflowError::DuplicateTask {
                    task: task.name.clone(),
                });
            }
            graph.add_node(idx);
            names.push(task.name.clone());
        }

        let mut predecessors = vec![Vec::new(); names.len()];
        let mut successors = vec![Vec::new(); names.len()];

        // Add run_after edges
        for (idx, task) in pipeline.tasks.iter().enumerate() {
            for dep_name in &task.run_after {
                let dep = *name_to_index.get(dep_name).ok_or_else(|| {
                    PipeflowError::UnknownTaskReference {
                        task: task.name.clone(),
                        reference: dep_name.clone(),
                    }
                })?;

                if predecessors[idx].contains(&dep) {
                    continue;
                }
                graph.add_edge(NodeIndex::new(dep), NodeIndex::new(idx), ());
                predecessors[idx].push(dep);
                successors[dep].push(idx);
            }
        }

        for list in predecessors.iter_mut().chain(successors.iter_mut()) {
            list.sort_unstable();
        }

        let mut dag = Dag {
            graph,
            names,
            name_to_index,
            predecessors,
            successors,
            order: Vec::new(),
        };

        dag.order = dag.stable_topological_order()?;
        Ok(dag)
    }
}

impl Dag {
    /// Number of tasks
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Task name at an index
    pub fn name(&self, idx: usize) -> &str {
        &self.names[idx]
    }

    /// Index of a task
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// Direct predecessors (ascending declaration order)
    pub fn predecessors(&self, idx: usize) -> &[usize] {
        &self.predecessors[idx]
    }

    /// Direct successors (ascending declaration order)
    pub fn successors(&self, idx: usize) -> &[usize] {
        &self.successors[idx]
    }

    /// Tasks without predecessors
    pub fn roots(&self) -> Vec<usize> {
        (0..self.len())
            .filter(|&i| self.predecessors[i].is_empty())
            .collect()
    }

    /// Every task transitively downstream of `idx`, ascending
    pub fn descendants(&self, idx: usize) -> Vec<usize> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![idx];
        while let Some(node) = stack.pop() {
            for &next in &self.successors[node] {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Topological order with ties broken by declaration order
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// Topological order as task names
    pub fn topological_order_names(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.names[i].as_str()).collect()
    }

    /// Names of a task's direct predecessors
    pub fn dependencies(&self, name: &str) -> Option<Vec<&str>> {
        let idx = self.index_of(name)?;
        Some(
            self.predecessors[idx]
                .iter()
                .map(|&i| self.names[i].as_str())
                .collect(),
        )
    }

    /// Names of a task's direct successors
    pub fn dependents(&self, name: &str) -> Option<Vec<&str>> {
        let idx = self.index_of(name)?;
        Some(
            self.successors[idx]
                .iter()
                .map(|&i| self.names[i].as_str())
                .collect(),
        )
    }

    /// Check if task A depends (directly or transitively) on task B
    pub fn depends_on(&self, task_a: &str, task_b: &str) -> bool {
        let (Some(a), Some(b)) = (self.index_of(task_a), self.index_of(task_b)) else {
            return false;
        };
        a != b && has_path_connecting(&self.graph, NodeIndex::new(b), NodeIndex::new(a), None)
    }

    /// Kahn's algorithm, always taking the lowest ready index
    fn stable_topological_order(&self) -> Result<Vec<usize>, PipeflowError> {
        let mut in_degree: Vec<usize> = self.predecessors.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(idx) = ready.pop_first() {
            order.push(idx);
            for &next in &self.successors[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() == self.len() {
            Ok(order)
        } else {
            Err(PipeflowError::CyclicDependency {
                cycle: self.find_cycle(),
            })
        }
    }

    /// Node sequence of one cycle, first node repeated at the end
    fn find_cycle(&self) -> Vec<String> {
        for component in tarjan_scc(&self.graph) {
            let members: HashSet<usize> = component.iter().map(|n| n.index()).collect();
            let start = match members.iter().min() {
                Some(&s) => s,
                None => continue,
            };
            let self_loop = self.successors[start].contains(&start);
            if members.len() < 2 && !self_loop {
                continue;
            }

            // Walk successors inside the component until a node repeats
            let mut path = vec![start];
            let mut position = HashMap::from([(start, 0usize)]);
            let mut current = start;
            loop {
                let next = self.successors[current]
                    .iter()
                    .copied()
                    .find(|n| members.contains(n))
                    .unwrap_or(start);
                if let Some(&at) = position.get(&next) {
                    let mut cycle: Vec<String> =
                        path[at..].iter().map(|&i| self.names[i].clone()).collect();
                    cycle.push(self.names[next].clone());
                    return cycle;
                }
                position.insert(next, path.len());
                path.push(next);
                current = next;
            }
        }
        Vec::new()
    }

    /// Generate Mermaid diagram of the DAG
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");

        for name in &self.names {
            out.push_str(&format!("    {}[{}]\n", mermaid_id(name), name));
        }

        for &idx in &self.order {
            for &next in &self.successors[idx] {
                out.push_str(&format!(
                    "    {} --> {}\n",
                    mermaid_id(&self.names[idx]),
                    mermaid_id(&self.names[next])
                ));
            }
        }

        out
    }

    /// Generate DOT diagram of the DAG
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph pipeline {\n");
        out.push_str("    rankdir=TB;\n");
        out.push_str("    node [shape=box, style=rounded];\n\n");

        for &idx in &self.order {
            for &next in &self.successors[idx] {
                out.push_str(&format!(
                    "    \"{}\" -> \"{}\";\n",
                    self.names[idx], self.names[next]
                ));
            }
        }

        // Isolated nodes have no edge to introduce them
        for (idx, name) in self.names.iter().enumerate() {
            if self.predecessors[idx].is_empty() && self.successors[idx].is_empty() {
                out.push_str(&format!("    \"{}\";\n", name));
            }
        }

        out.push_str("}\n");
        out
    }

    /// Generate text representation of the execution order
    pub fn to_text(&self, pipeline: &PipelineDefinition) -> String {
        let mut out = String::new();

        for (i, &idx) in self.order.iter().enumerate() {
            let task = &pipeline.tasks[idx];
            out.push_str(&format!("{}. {} ({})", i + 1, task.name, task.task_ref));

            let deps = self.dependencies(&task.name).unwrap_or_default();
            if !deps.is_empty() {
                out.push_str(&format!(" [after: {}]", deps.join(", ")));
            }

            out.push('\n');
        }

        out
    }
}

/// Mermaid node ids cannot contain dashes
fn mermaid_id(name: &str) -> String {
    name.replace(|c: char| !c.is_ascii_alphanumeric() && c != '_', "_")
}

/// Task names end up in log paths and container names
fn is_valid_task_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TaskNode;

    fn make_test_pipeline(tasks: Vec<(&str, Vec<&str>)>) -> PipelineDefinition {
        PipelineDefinition {
            version: "1".into(),
            name: "test".into(),
            description: None,
            params: vec![],
            workspaces: vec![],
            specs: vec![],
            tasks: tasks
                .into_iter()
                .map(|(name, deps)| TaskNode::new(name, "noop").after(&deps))
                .collect(),
        }
    }

    fn ci_cd() -> PipelineDefinition {
        make_test_pipeline(vec![
            ("init", vec![]),
            ("clone", vec!["init"]),
            ("lint", vec!["clone"]),
            ("tests", vec!["clone"]),
            ("build", vec!["lint", "tests"]),
            ("deploy", vec!["build"]),
        ])
    }

    #[test]
    fn test_linear_dag() {
        let pipeline = make_test_pipeline(vec![("a", vec![]), ("b", vec!["a"]), ("c", vec!["b"])]);

        let dag = DagBuilder::build(&pipeline).unwrap();
        assert_eq!(dag.topological_order_names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_order_respects_predecessors_regardless_of_declaration() {
        let pipeline = make_test_pipeline(vec![
            ("deploy", vec!["build"]),
            ("build", vec!["lint", "tests"]),
            ("tests", vec!["clone"]),
            ("lint", vec!["clone"]),
            ("clone", vec![]),
        ]);

        let dag = DagBuilder::build(&pipeline).unwrap();
        let order = dag.topological_order();
        let position: HashMap<usize, usize> =
            order.iter().enumerate().map(|(pos, &idx)| (idx, pos)).collect();

        for idx in 0..dag.len() {
            for &pred in dag.predecessors(idx) {
                assert!(position[&pred] < position[&idx]);
            }
        }
        assert_eq!(dag.topological_order_names(), vec!["clone", "tests", "lint", "build", "deploy"]);
    }

    #[test]
    fn test_diamond_ties_break_by_declaration_order() {
        let dag = DagBuilder::build(&ci_cd()).unwrap();
        assert_eq!(
            dag.topological_order_names(),
            vec!["init", "clone", "lint", "tests", "build", "deploy"]
        );
        assert_eq!(dag.roots(), vec![0]);
    }

    #[test]
    fn test_cycle_reports_node_sequence() {
        let pipeline = make_test_pipeline(vec![("a", vec!["b"]), ("b", vec!["a"])]);

        match DagBuilder::build(&pipeline) {
            Err(PipeflowError::CyclicDependency { cycle }) => {
                assert_eq!(cycle, vec!["a", "b", "a"]);
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_task_names_must_be_path_safe() {
        for bad in ["a/b", "..", "../escape", "", " build", "-x"] {
            let pipeline = make_test_pipeline(vec![(bad, vec![])]);
            assert!(
                matches!(DagBuilder::build(&pipeline), Err(PipeflowError::InvalidPipeline { .. })),
                "{:?} should be rejected",
                bad
            );
        }

        let pipeline = make_test_pipeline(vec![("build-image_v2.1", vec![])]);
        assert!(DagBuilder::build(&pipeline).is_ok());
    }

    #[test]
    fn test_cycle_inside_larger_graph() {
        let pipeline = make_test_pipeline(vec![
            ("root", vec![]),
            ("x", vec!["root", "z"]),
            ("y", vec!["x"]),
            ("z", vec!["y"]),
        ]);

        match DagBuilder::build(&pipeline) {
            Err(PipeflowError::CyclicDependency { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                assert!(!cycle.contains(&"root".to_string()));
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let pipeline = make_test_pipeline(vec![("a", vec!["a"])]);
        match DagBuilder::build(&pipeline) {
            Err(PipeflowError::CyclicDependency { cycle }) => assert_eq!(cycle, vec!["a", "a"]),
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_task_reference() {
        let pipeline = make_test_pipeline(vec![("a", vec!["nonexistent"])]);

        let result = DagBuilder::build(&pipeline);
        assert!(matches!(
            result,
            Err(PipeflowError::UnknownTaskReference { ref reference, .. }) if reference == "nonexistent"
        ));
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let pipeline = make_test_pipeline(vec![("a", vec![]), ("a", vec![])]);
        assert!(matches!(
            DagBuilder::build(&pipeline),
            Err(PipeflowError::DuplicateTask { .. })
        ));
    }

    #[test]
    fn test_descendants_and_depends_on() {
        let dag = DagBuilder::build(&ci_cd()).unwrap();
        let lint = dag.index_of("lint").unwrap();

        let names: Vec<&str> = dag.descendants(lint).into_iter().map(|i| dag.name(i)).collect();
        assert_eq!(names, vec!["build", "deploy"]);

        assert!(dag.depends_on("deploy", "init"));
        assert!(dag.depends_on("build", "tests"));
        assert!(!dag.depends_on("tests", "lint"));
        assert!(!dag.depends_on("init", "deploy"));
    }

    #[test]
    fn test_mermaid_output() {
        let pipeline = make_test_pipeline(vec![("repo-clone", vec![]), ("b", vec!["repo-clone"])]);

        let mermaid = DagBuilder::build(&pipeline).unwrap().to_mermaid();
        assert!(mermaid.contains("graph TD"));
        assert!(mermaid.contains("repo_clone[repo-clone]"));
        assert!(mermaid.contains("repo_clone --> b"));
    }

    #[test]
    fn test_dot_lists_isolated_nodes() {
        let pipeline = make_test_pipeline(vec![("a", vec![]), ("b", vec!["a"]), ("lonely", vec![])]);

        let dot = DagBuilder::build(&pipeline).unwrap().to_dot();
        assert!(dot.contains("\"a\" -> \"b\";"));
        assert!(dot.contains("    \"lonely\";"));
    }
}
