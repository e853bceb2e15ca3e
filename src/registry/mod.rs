// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Task registry
//!
//! Maps task spec names to executable [`TaskSpec`]s. Specs come from the
//! pipeline document itself or from a directory of YAML files.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::PipeflowError;
use crate::pipeline::ParamDecl;

/// An executable unit: what to run, which parameters and workspaces it takes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Spec name (registry key)
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Container image; runs through the container runner when set
    #[serde(default)]
    pub image: Option<String>,

    /// Entrypoint and fixed arguments
    #[serde(default)]
    pub command: Vec<String>,

    /// Argument templates appended after `command`
    #[serde(default)]
    pub args: Vec<String>,

    /// Script template run through the configured shell instead of `command`
    #[serde(default)]
    pub script: Option<String>,

    /// Parameter schema
    #[serde(default)]
    pub params: Vec<ParamDecl>,

    /// Workspace roles this spec expects to be bound
    #[serde(default)]
    pub workspaces: Vec<String>,

    /// Environment templates
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-attempt timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl TaskSpec {
    /// A shell-script spec with no parameters or workspaces
    pub fn script(name: &str, script: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            image: None,
            command: vec![],
            args: vec![],
            script: Some(script.to_string()),
            params: vec![],
            workspaces: vec![],
            env: BTreeMap::new(),
            retry: RetryPolicy::default(),
            timeout_secs: None,
        }
    }

    /// Look up a declared parameter
    pub fn param(&self, name: &str) -> Option<&ParamDecl> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Whether the spec expects a workspace in this role
    pub fn declares_workspace(&self, role: &str) -> bool {
        self.workspaces.iter().any(|w| w == role)
    }

    /// Every template string of the spec, labelled by where it lives
    pub fn templates(&self) -> Vec<(String, &str)> {
        let mut out = Vec::new();
        for (i, arg) in self.args.iter().enumerate() {
            out.push((format!("args[{}]", i), arg.as_str()));
        }
        if let Some(ref script) = self.script {
            out.push(("script".to_string(), script.as_str()));
        }
        for (key, value) in &self.env {
            out.push((format!("env.{}", key), value.as_str()));
        }
        out
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// How retry delays grow between attempts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// Delay doubles after every retry
    Exponential,
}

/// Retry policy for non-zero task exits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one
    #[serde(default)]
    pub retries: u32,

    /// Delay before the first retry
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    #[serde(default)]
    pub backoff: Backoff,

    /// Upper bound for exponential delays
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            delay_ms: default_delay_ms(),
            backoff: Backoff::default(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration, backoff: Backoff) -> Self {
        Self {
            retries,
            delay_ms: delay.as_millis() as u64,
            backoff,
            max_delay_ms: default_max_delay_ms(),
        }
    }

    /// Total attempts allowed
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay before retrying after `attempt` (1-based) failed
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = match self.backoff {
            Backoff::Fixed => self.delay_ms,
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
                self.delay_ms.saturating_mul(factor).min(self.max_delay_ms)
            }
        };
        Duration::from_millis(ms)
    }
}

/// Registry of task specs by name
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    specs: HashMap<String, TaskSpec>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spec, replacing any earlier spec of the same name
    pub fn register(&mut self, spec: TaskSpec) {
        if self.specs.contains_key(&spec.name) {
            warn!("Task spec '{}' registered twice; keeping the later one", spec.name);
        }
        self.specs.insert(spec.name.clone(), spec);
    }

    /// Register several specs
    pub fn extend(&mut self, specs: impl IntoIterator<Item = TaskSpec>) {
        for spec in specs {
            self.register(spec);
        }
    }

    pub fn get(&self, name: &str) -> Option<&TaskSpec> {
        self.specs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Spec names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.specs.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Load a single spec file; a file may hold one spec or a list of specs
    pub fn load_file(&mut self, path: &Path) -> Result<usize, PipeflowError> {
        let content = std::fs::read_to_string(path).map_err(|e| PipeflowError::FileReadError {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let specs: Vec<TaskSpec> = match serde_yaml::from_str::<Vec<TaskSpec>>(&content) {
            Ok(list) => list,
            Err(_) => vec![serde_yaml::from_str::<TaskSpec>(&content)?],
        };

        let count = specs.len();
        debug!("Loaded {} task spec(s) from {}", count, path.display());
        self.extend(specs);
        Ok(count)
    }

    /// Load every `.yaml`/`.yml` file in a directory, in file-name order
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, PipeflowError> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            );
            if path.is_file() && is_yaml {
                paths.push(path);
            }
        }
        paths.sort();

        let mut total = 0;
        for path in paths {
            total += self.load_file(&path)?;
        }
        Ok(total)
    }
}
