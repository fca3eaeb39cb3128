//! Configuration specification types for keel.
//!
//! These structs map one-to-one onto `keel.yaml`. They describe the modules
//! that make up the infrastructure, the environments they are promoted
//! through, and how state, execution and provisioning are wired up.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeelConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Execution tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Provisioning capability per module kind.
    #[serde(default)]
    pub provisioners: BTreeMap<String, ProvisionerConfig>,
    /// Modules in declaration order.
    pub modules: Vec<ModuleConfig>,
    /// Deployment environments.
    pub environments: Vec<EnvironmentConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// Seconds after which an unreleased lock is considered abandoned.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    /// Seconds to wait for a held lock; zero fails immediately.
    #[serde(default)]
    pub lock_wait_secs: u64,
    /// Break stale locks automatically instead of reporting them.
    #[serde(default)]
    pub take_over_stale_locks: bool,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Execution tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Timeout for a single provisioning step, in seconds.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
}

/// How a module kind is provisioned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum ProvisionerConfig {
    /// JSON over HTTP to a control-plane endpoint.
    Http {
        /// Base URL; `/apply` and `/destroy` are appended.
        endpoint: String,
        /// Name of the environment variable holding a bearer token.
        #[serde(default)]
        token_env: Option<String>,
        /// Request timeout in seconds.
        #[serde(default = "default_http_timeout")]
        timeout_secs: u64,
    },
    /// Deterministic local outputs, for dry runs.
    Echo,
}

/// A single infrastructure module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleConfig {
    /// Unique module identifier.
    pub name: String,
    /// Module kind, selects the provisioner.
    pub kind: String,
    /// Modules whose outputs this module consumes.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Input parameters.
    #[serde(default)]
    pub inputs: BTreeMap<String, InputValue>,
    /// Output names this module produces.
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// An input parameter: a literal value or a reference to another module's output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum InputValue {
    /// Value taken from a dependency's outputs at plan/apply time.
    Output(OutputRef),
    /// Literal value, passed through opaquely.
    Literal(serde_json::Value),
}

/// Reference to an output of another module, written `module.output`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OutputRef {
    /// The `module.output` path.
    pub from_output: String,
}

/// A deployment environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentConfig {
    /// Environment identifier.
    pub name: String,
    /// Branch whose pushes trigger this environment.
    pub branch: String,
    /// How plans are approved.
    #[serde(default)]
    pub approval: ApprovalMode,
    /// Seconds to wait for a manual approval signal.
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_secs: u64,
    /// Per-module input overrides.
    #[serde(default)]
    pub overrides: BTreeMap<String, BTreeMap<String, InputValue>>,
    /// Modules not deployed to this environment.
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Approval policy for an environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Plans are applied as soon as they are computed.
    #[default]
    Auto,
    /// Plans wait for an explicit approval signal.
    Manual,
}

// Default value functions

const fn default_lock_ttl() -> u64 {
    300
}

const fn default_step_timeout() -> u64 {
    1800
}

const fn default_http_timeout() -> u64 {
    60
}

const fn default_approval_timeout() -> u64 {
    3600
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::Local,
            bucket: None,
            prefix: None,
            region: None,
            path: None,
            lock_ttl_secs: default_lock_ttl(),
            lock_wait_secs: 0,
            take_over_stale_locks: false,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout(),
        }
    }
}

impl OutputRef {
    /// Creates a reference to `module.output`.
    #[must_use]
    pub fn new(module: &str, output: &str) -> Self {
        Self {
            from_output: format!("{module}.{output}"),
        }
    }

    /// Splits the reference into `(module, output)`.
    #[must_use]
    pub fn target(&self) -> Option<(&str, &str)> {
        self.from_output
            .split_once('.')
            .filter(|(module, output)| !module.is_empty() && !output.is_empty())
    }

    /// Returns the referenced module, if the reference is well formed.
    #[must_use]
    pub fn module(&self) -> Option<&str> {
        self.target().map(|(module, _)| module)
    }
}

impl std::fmt::Display for OutputRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.from_output)
    }
}

impl InputValue {
    /// Creates a literal input.
    #[must_use]
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Creates an output reference input.
    #[must_use]
    pub fn output(module: &str, output: &str) -> Self {
        Self::Output(OutputRef::new(module, output))
    }
}

impl ModuleConfig {
    /// Returns declared dependencies followed by modules referenced from inputs.
    #[must_use]
    pub fn effective_dependencies(&self) -> Vec<String> {
        effective_dependencies(&self.depends_on, self.inputs.values())
    }
}

/// Merges declared dependencies with those implied by output references.
pub(crate) fn effective_dependencies<'a>(
    declared: &[String],
    inputs: impl Iterator<Item = &'a InputValue>,
) -> Vec<String> {
    let mut deps: Vec<String> = Vec::with_capacity(declared.len());
    for dep in declared {
        if !deps.contains(dep) {
            deps.push(dep.clone());
        }
    }
    for input in inputs {
        if let InputValue::Output(reference) = input
            && let Some(module) = reference.module()
            && !deps.iter().any(|d| d == module)
        {
            deps.push(module.to_string());
        }
    }
    deps
}

impl KeelConfig {
    /// Looks up an environment by name.
    #[must_use]
    pub fn environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|e| e.name == name)
    }

    /// Looks up a module by name.
    #[must_use]
    pub fn module(&self, name: &str) -> Option<&ModuleConfig> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Returns module names in declaration order.
    #[must_use]
    pub fn module_names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name.as_str()).collect()
    }

    /// Returns environment names in declaration order.
    #[must_use]
    pub fn environment_names(&self) -> Vec<&str> {
        self.environments.iter().map(|e| e.name.as_str()).collect()
    }
}
