// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Parameter resolution and `$(...)` substitution
//!
//! Only `params.`, `workspaces.` and `context.` tokens belong to the engine.
//! Anything else in `$(...)` form is shell syntax and passes through.

use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use tracing::warn;

use crate::errors::PipeflowError;
use crate::pipeline::ParamDecl;

fn token_pattern() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| {
        Regex::new(r"\$\(((?:params|workspaces|context)\.[A-Za-z0-9_.\-]+)\)")
            .expect("token pattern is valid")
    })
}

/// A closed mapping of parameter name to value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedParams(BTreeMap<String, String>);

impl ResolvedParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for ResolvedParams {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// Resolves declared parameters against caller overrides
pub struct ParameterResolver;

impl ParameterResolver {
    /// Override, then default, else `MissingRequiredParameter`
    pub fn resolve(
        decls: &[ParamDecl],
        overrides: &HashMap<String, String>,
    ) -> Result<ResolvedParams, PipeflowError> {
        let mut resolved = BTreeMap::new();

        for decl in decls {
            let value = overrides
                .get(&decl.name)
                .or(decl.default.as_ref())
                .ok_or_else(|| PipeflowError::MissingRequiredParameter {
                    param: decl.name.clone(),
                })?;
            resolved.insert(decl.name.clone(), value.clone());
        }

        for name in overrides.keys() {
            if !decls.iter().any(|d| &d.name == name) {
                warn!("Ignoring override for undeclared parameter '{}'", name);
            }
        }

        Ok(ResolvedParams(resolved))
    }

    /// Parse `key=value` pairs as given on the command line
    pub fn parse_overrides(pairs: &[String]) -> Result<HashMap<String, String>, PipeflowError> {
        pairs
            .iter()
            .map(|pair| {
                pair.split_once('=')
                    .filter(|(key, _)| !key.is_empty())
                    .map(|(key, value)| (key.trim().to_string(), value.to_string()))
                    .ok_or_else(|| PipeflowError::InvalidPipeline {
                        reason: format!("parameter override '{}' is not key=value", pair),
                        help: Some("Use -p name=value".into()),
                    })
            })
            .collect()
    }
}

/// An engine reference found in a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// `$(params.X)`
    Param(String),
    /// `$(workspaces.W.path)`
    WorkspacePath(String),
    /// `$(context.run.id)`, `$(context.pipeline.name)`
    Context(String),
    /// Engine namespace but no known shape
    Malformed(String),
}

impl Reference {
    fn parse(raw: &str) -> Self {
        if let Some(name) = raw.strip_prefix("params.") {
            return Self::Param(name.to_string());
        }
        if let Some(rest) = raw.strip_prefix("workspaces.") {
            return match rest.strip_suffix(".path") {
                Some(name) if !name.is_empty() => Self::WorkspacePath(name.to_string()),
                _ => Self::Malformed(raw.to_string()),
            };
        }
        if let Some(key) = raw.strip_prefix("context.") {
            return match key {
                "run.id" | "pipeline.name" => Self::Context(key.to_string()),
                _ => Self::Malformed(raw.to_string()),
            };
        }
        Self::Malformed(raw.to_string())
    }
}

/// All engine references in a template, in order of appearance
pub fn references(template: &str) -> Vec<Reference> {
    token_pattern()
        .captures_iter(template)
        .map(|c| Reference::parse(&c[1]))
        .collect()
}

/// Values available to substitution; a `None` namespace is left untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct Scope<'a> {
    pub params: Option<&'a BTreeMap<String, String>>,
    pub workspaces: Option<&'a BTreeMap<String, String>>,
    pub context: Option<&'a BTreeMap<String, String>>,
}

impl<'a> Scope<'a> {
    pub fn params(params: &'a BTreeMap<String, String>) -> Self {
        Self {
            params: Some(params),
            ..Self::default()
        }
    }
}

/// Replace engine tokens in `template`; `location` names it in errors
pub fn substitute(template: &str, scope: &Scope<'_>, location: &str) -> Result<String, PipeflowError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in token_pattern().captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let raw = &caps[1];
        let unresolved = || PipeflowError::UnresolvedReference {
            reference: raw.to_string(),
            location: location.to_string(),
        };

        let value = match Reference::parse(raw) {
            Reference::Param(name) => scope.params.map(|p| p.get(&name).ok_or_else(unresolved)),
            Reference::WorkspacePath(name) => {
                scope.workspaces.map(|w| w.get(&name).ok_or_else(unresolved))
            }
            Reference::Context(key) => scope.context.map(|c| c.get(&key).ok_or_else(unresolved)),
            Reference::Malformed(_) => return Err(unresolved()),
        };

        out.push_str(&template[last..whole.start()]);
        match value {
            Some(resolved) => out.push_str(resolved?),
            None => out.push_str(whole.as_str()),
        }
        last = whole.end();
    }

    out.push_str(&template[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_required_parameter() {
        let decls = vec![ParamDecl::required("repo-url")];
        let result = ParameterResolver::resolve(&decls, &HashMap::new());
        assert!(matches!(
            result,
            Err(PipeflowError::MissingRequiredParameter { ref param }) if param == "repo-url"
        ));
    }

    #[test]
    fn test_override_beats_default() {
        let decls = vec![
            ParamDecl::required("repo-url"),
            ParamDecl::with_default("branch", "main"),
            ParamDecl::with_default("image", "app:latest"),
        ];
        let resolved = ParameterResolver::resolve(
            &decls,
            &overrides(&[("repo-url", "https://x.git"), ("image", "app:v2"), ("extra", "1")]),
        )
        .unwrap();

        assert_eq!(resolved.get("repo-url"), Some("https://x.git"));
        assert_eq!(resolved.get("branch"), Some("main"));
        assert_eq!(resolved.get("image"), Some("app:v2"));
        assert_eq!(resolved.get("extra"), None);
        assert_eq!(resolved.len(), 3);
    }

    #[test]
    fn test_substitute_params() {
        let params = BTreeMap::from([("repo-url".to_string(), "https://x.git".to_string())]);
        let out = substitute(
            "git clone $(params.repo-url) --depth 1",
            &Scope::params(&params),
            "clone.args",
        )
        .unwrap();
        assert_eq!(out, "git clone https://x.git --depth 1");
    }

    #[test]
    fn test_undeclared_param_is_unresolved() {
        let params = BTreeMap::new();
        let result = substitute("$(params.nope)", &Scope::params(&params), "lint.script");
        match result {
            Err(PipeflowError::UnresolvedReference { reference, location }) => {
                assert_eq!(reference, "params.nope");
                assert_eq!(location, "lint.script");
            }
            other => panic!("expected unresolved reference, got {:?}", other),
        }
    }

    #[test]
    fn test_shell_substitution_and_deferred_namespaces_pass_through() {
        let params = BTreeMap::from([("tag".to_string(), "v1".to_string())]);
        let out = substitute(
            "echo $(date) > $(workspaces.out.path)/$(params.tag)",
            &Scope::params(&params),
            "build.script",
        )
        .unwrap();
        assert_eq!(out, "echo $(date) > $(workspaces.out.path)/v1");
    }

    #[test]
    fn test_values_are_not_expanded_twice() {
        let params = BTreeMap::from([("a".to_string(), "$(params.b)".to_string())]);
        let out = substitute("$(params.a)", &Scope::params(&params), "x").unwrap();
        assert_eq!(out, "$(params.b)");
    }

    #[test]
    fn test_references_classify_tokens() {
        let refs = references("$(params.url) $(workspaces.src.path) $(context.run.id) $(workspaces.src)");
        assert_eq!(
            refs,
            vec![
                Reference::Param("url".into()),
                Reference::WorkspacePath("src".into()),
                Reference::Context("run.id".into()),
                Reference::Malformed("workspaces.src".into()),
            ]
        );
    }

    #[test]
    fn test_parse_overrides() {
        let parsed = ParameterResolver::parse_overrides(&[
            "repo-url=https://x.git".to_string(),
            "query=a=b".to_string(),
        ])
        .unwrap();
        assert_eq!(parsed["repo-url"], "https://x.git");
        assert_eq!(parsed["query"], "a=b");

        assert!(ParameterResolver::parse_overrides(&["novalue".to_string()]).is_err());
        assert!(ParameterResolver::parse_overrides(&["=x".to_string()]).is_err());
    }
}
