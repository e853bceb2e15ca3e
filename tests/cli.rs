// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! End-to-end tests of the pipeflow binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

const CONFIG: &str = r#"
runner = "shell"
shell = "sh"
infra_backoff_ms = 10
"#;

const BUILD: &str = r#"
name: build
params:
  - name: target
    default: release
workspaces:
  - name: out
specs:
  - name: write
    params:
      - name: text
    workspaces: [dir]
    script: echo "$(params.text)" >> "$(workspaces.dir.path)/log.txt"
  - name: check
    workspaces: [dir]
    script: grep -q compile "$(workspaces.dir.path)/log.txt"
tasks:
  - name: compile
    taskRef: write
    params:
      text: compile $(params.target)
    workspaces:
      dir: out
  - name: verify
    taskRef: check
    runAfter: [compile]
    workspaces:
      dir: out
"#;

const FAILING: &str = r#"
name: failing
specs:
  - name: fail
    script: |
      echo "something broke" >&2
      exit 3
  - name: noop
    script: "true"
tasks:
  - name: lint
    taskRef: fail
  - name: package
    taskRef: noop
    runAfter: [lint]
"#;

const CYCLIC: &str = r#"
name: cyclic
specs:
  - name: noop
    script: "true"
tasks:
  - name: a
    taskRef: noop
    runAfter: [b]
  - name: b
    taskRef: noop
    runAfter: [a]
"#;

const NEEDS_PARAM: &str = r#"
name: needs-param
params:
  - name: repo-url
specs:
  - name: echo
    params:
      - name: url
    script: echo "$(params.url)"
tasks:
  - name: clone
    taskRef: echo
    params:
      url: $(params.repo-url)
"#;

fn project() -> TempDir {
    let temp = TempDir::new().unwrap();
    write(temp.path(), "pipeflow.toml", CONFIG);
    write(temp.path(), "build.yaml", BUILD);
    write(temp.path(), "failing.yaml", FAILING);
    write(temp.path(), "cyclic.yaml", CYCLIC);
    write(temp.path(), "needs-param.yaml", NEEDS_PARAM);
    temp
}

fn write(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

fn pipeflow(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("pipeflow").unwrap();
    cmd.arg("-C")
        .arg(dir)
        .env_remove("PIPEFLOW_CONFIG")
        .env_remove("PIPEFLOW_CONCURRENCY")
        .env_remove("PIPEFLOW_RUNNER")
        .env("NO_COLOR", "1");
    cmd
}

#[test]
fn test_validate_accepts_valid_pipeline() {
    let temp = project();
    pipeflow(temp.path())
        .args(["validate", "build.yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Pipeline is valid"));
}

#[test]
fn test_validate_rejects_cycle_with_exit_code_2() {
    let temp = project();
    pipeflow(temp.path())
        .args(["validate", "cyclic.yaml"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("Cyclic dependency"));
}

#[test]
fn test_validate_with_params_checks_required_ones() {
    let temp = project();
    pipeflow(temp.path())
        .args(["validate", "needs-param.yaml", "-p", "branch=main"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("repo-url"));

    pipeflow(temp.path())
        .args(["validate", "needs-param.yaml", "-p", "repo-url=https://x.git"])
        .assert()
        .success();
}

#[test]
fn test_graph_formats() {
    let temp = project();
    pipeflow(temp.path())
        .args(["graph", "build.yaml", "--format", "mermaid"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("graph TD"))
        .stdout(predicate::str::contains("compile --> verify"));

    pipeflow(temp.path())
        .args(["graph", "build.yaml", "-f", "dot"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"compile\" -> \"verify\";"));

    pipeflow(temp.path())
        .args(["graph", "cyclic.yaml"])
        .assert()
        .code(2);
}

#[test]
fn test_run_succeeds_and_is_recorded() {
    let temp = project();
    pipeflow(temp.path())
        .args(["run", "build.yaml", "-p", "target=debug"])
        .assert()
        .success()
        .stdout(predicate::str::contains("succeeded"));

    let output = pipeflow(temp.path())
        .args(["status", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let runs: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let runs = runs.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["pipeline"], "build");
    assert_eq!(runs[0]["status"], "succeeded");
    assert_eq!(runs[0]["params"]["target"], "debug");

    let run_id = runs[0]["run_id"].as_str().unwrap();
    pipeflow(temp.path())
        .args(["status", run_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("compile"))
        .stdout(predicate::str::contains("verify"));

    // A finished, successful run has nothing left to do
    pipeflow(temp.path())
        .args(["resume", run_id, "build.yaml"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("already succeeded"));
}

#[test]
fn test_failed_task_exits_1_and_skips_dependents() {
    let temp = project();
    pipeflow(temp.path())
        .args(["run", "failing.yaml"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("exited with code 3"))
        .stdout(predicate::str::contains("upstream 'lint' did not succeed"))
        .stderr(predicate::str::contains("something broke"))
        .stderr(predicate::str::contains("Task 'lint' failed"));
}

#[test]
fn test_missing_parameter_exits_2() {
    let temp = project();
    pipeflow(temp.path())
        .args(["run", "needs-param.yaml"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Missing required parameter 'repo-url'"));
}

#[test]
fn test_bad_override_syntax_exits_2() {
    let temp = project();
    pipeflow(temp.path())
        .args(["run", "build.yaml", "-p", "target"])
        .assert()
        .code(2);
}

#[test]
fn test_unknown_run_id() {
    let temp = project();
    pipeflow(temp.path())
        .args(["status", "not-a-run"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_status_without_runs() {
    let temp = project();
    pipeflow(temp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs recorded"));
}
