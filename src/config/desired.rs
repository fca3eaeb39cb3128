//! Per-environment resolved configuration.
//!
//! A [`DesiredConfiguration`] is what a single cycle plans against: the base
//! module declarations with one environment's overrides applied and its
//! excluded modules removed. It is built once and never mutated afterwards.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::ConfigError;

use super::spec::{InputValue, KeelConfig, effective_dependencies};

/// A module as it will be deployed to one environment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DesiredModule {
    /// Module identifier.
    pub name: String,
    /// Module kind.
    pub kind: String,
    /// Effective dependencies (declared plus referenced).
    pub depends_on: Vec<String>,
    /// Inputs after environment overrides.
    pub inputs: BTreeMap<String, InputValue>,
    /// Declared output names.
    pub outputs: Vec<String>,
}

/// Resolved desired state for one environment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DesiredConfiguration {
    environment: String,
    modules: Vec<DesiredModule>,
}

/// An output reference that could not be satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedReference {
    /// Input holding the reference.
    pub input: String,
    /// The `module.output` path.
    pub reference: String,
}

impl DesiredModule {
    /// Creates a module with literal inputs only, mostly useful in tests and
    /// when embedding keel as a library.
    #[must_use]
    pub fn new(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            depends_on: Vec::new(),
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
        }
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn depends_on(mut self, module: &str) -> Self {
        if !self.depends_on.iter().any(|d| d == module) {
            self.depends_on.push(module.to_string());
        }
        self
    }

    /// Adds an input; output references also register the dependency.
    #[must_use]
    pub fn input(mut self, key: &str, value: InputValue) -> Self {
        if let InputValue::Output(reference) = &value
            && let Some(module) = reference.module()
            && !self.depends_on.iter().any(|d| d == module)
        {
            self.depends_on.push(module.to_string());
        }
        self.inputs.insert(key.to_string(), value);
        self
    }

    /// Declares an output.
    #[must_use]
    pub fn output(mut self, name: &str) -> Self {
        self.outputs.push(name.to_string());
        self
    }

    /// Resolves inputs into concrete values.
    ///
    /// `lookup` receives `(module, output)` for every reference and returns
    /// the realized value, if any.
    ///
    /// # Errors
    ///
    /// Returns the first reference that `lookup` could not satisfy, or that is
    /// not of the form `module.output`.
    pub fn resolve_inputs<F>(&self, lookup: F) -> Result<BTreeMap<String, Value>, UnresolvedReference>
    where
        F: Fn(&str, &str) -> Option<Value>,
    {
        resolve_input_map(&self.inputs, lookup)
    }
}

/// Resolves an input map, see [`DesiredModule::resolve_inputs`].
pub(crate) fn resolve_input_map<F>(
    inputs: &BTreeMap<String, InputValue>,
    lookup: F,
) -> Result<BTreeMap<String, Value>, UnresolvedReference>
where
    F: Fn(&str, &str) -> Option<Value>,
{
    let mut resolved = BTreeMap::new();
    for (key, input) in inputs {
        let value = match input {
            InputValue::Literal(value) => value.clone(),
            InputValue::Output(reference) => reference
                .target()
                .and_then(|(module, output)| lookup(module, output))
                .ok_or_else(|| UnresolvedReference {
                    input: key.clone(),
                    reference: reference.to_string(),
                })?,
        };
        resolved.insert(key.clone(), value);
    }
    Ok(resolved)
}

impl DesiredConfiguration {
    /// Resolves the configuration for a named environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownEnvironment`] if the environment is not declared.
    pub fn for_environment(config: &KeelConfig, environment: &str) -> Result<Self, ConfigError> {
        let env = config
            .environment(environment)
            .ok_or_else(|| ConfigError::UnknownEnvironment {
                name: environment.to_string(),
            })?;

        let mut modules = Vec::with_capacity(config.modules.len());
        for module in &config.modules {
            if env.exclude.contains(&module.name) {
                debug!(module = %module.name, environment, "Module excluded");
                continue;
            }

            let mut inputs = module.inputs.clone();
            if let Some(overrides) = env.overrides.get(&module.name) {
                for (key, value) in overrides {
                    inputs.insert(key.clone(), value.clone());
                }
            }

            modules.push(DesiredModule {
                name: module.name.clone(),
                kind: module.kind.clone(),
                depends_on: effective_dependencies(&module.depends_on, inputs.values()),
                inputs,
                outputs: module.outputs.clone(),
            });
        }

        Ok(Self {
            environment: environment.to_string(),
            modules,
        })
    }

    /// Builds a configuration directly from modules.
    #[must_use]
    pub fn from_modules(environment: &str, modules: Vec<DesiredModule>) -> Self {
        Self {
            environment: environment.to_string(),
            modules,
        }
    }

    /// Environment name.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Modules in declaration order.
    #[must_use]
    pub fn modules(&self) -> &[DesiredModule] {
        &self.modules
    }

    /// Looks up a module by name.
    #[must_use]
    pub fn module(&self, name: &str) -> Option<&DesiredModule> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Returns true if the module is deployed to this environment.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.module(name).is_some()
    }

    /// Number of modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns true if nothing is deployed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> KeelConfig {
        serde_yaml::from_str(
            r"
project:
  name: shop
modules:
  - name: network
    kind: network
    inputs:
      cidr: 10.0.0.0/16
    outputs: [vpc_id]
  - name: cluster
    kind: cluster
    inputs:
      vpc: { from_output: network.vpc_id }
      size: 3
  - name: ingress
    kind: ingress
    depends_on: [cluster]
environments:
  - name: staging
    branch: develop
    overrides:
      cluster:
        size: 1
    exclude: [ingress]
  - name: prod
    branch: main
",
        )
        .expect("config should parse")
    }

    #[test]
    fn test_overrides_and_excludes_applied() {
        let desired = DesiredConfiguration::for_environment(&config(), "staging")
            .expect("staging exists");
        assert_eq!(desired.environment(), "staging");
        assert_eq!(desired.len(), 2);
        assert!(!desired.contains("ingress"));

        let cluster = desired.module("cluster").expect("cluster present");
        assert_eq!(cluster.inputs["size"], InputValue::literal(1));
        assert_eq!(cluster.depends_on, vec!["network"]);
    }

    #[test]
    fn test_environment_without_overrides_keeps_base() {
        let desired =
            DesiredConfiguration::for_environment(&config(), "prod").expect("prod exists");
        assert_eq!(desired.len(), 3);
        let cluster = desired.module("cluster").expect("cluster present");
        assert_eq!(cluster.inputs["size"], InputValue::literal(3));
    }

    #[test]
    fn test_unknown_environment() {
        let err = DesiredConfiguration::for_environment(&config(), "qa").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEnvironment { name } if name == "qa"));
    }

    #[test]
    fn test_resolve_inputs() {
        let module = DesiredModule::new("cluster", "cluster")
            .input("vpc", InputValue::output("network", "vpc_id"))
            .input("size", InputValue::literal(3));
        assert_eq!(module.depends_on, vec!["network"]);

        let resolved = module
            .resolve_inputs(|m, o| (m == "network" && o == "vpc_id").then(|| json!("vpc-1")))
            .expect("reference resolves");
        assert_eq!(resolved["vpc"], json!("vpc-1"));
        assert_eq!(resolved["size"], json!(3));

        let err = module.resolve_inputs(|_, _| None).unwrap_err();
        assert_eq!(err.input, "vpc");
        assert_eq!(err.reference, "network.vpc_id");
    }
}
