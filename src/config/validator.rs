//! Configuration validation.
//!
//! The validator walks the whole document and collects every problem it
//! finds instead of stopping at the first one, so `keel validate` can show a
//! complete report. Graph-level problems such as cycles are left to
//! [`crate::graph::ResourceGraph`].

use crate::error::{ConfigError, KeelError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use super::spec::{
    ApprovalMode, EnvironmentConfig, InputValue, KeelConfig, ModuleConfig, StateBackend,
    StateConfig,
};

/// Validator for keel configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator {
    /// Fail on module kinds with no provisioner instead of warning.
    strict_kinds: bool,
}

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            strict_kinds: false,
        }
    }

    /// Treats module kinds without a provisioner as errors.
    #[must_use]
    pub const fn strict_kinds(mut self, strict: bool) -> Self {
        self.strict_kinds = strict;
        self
    }

    /// Validates a configuration, returning the full result.
    #[must_use]
    pub fn check(&self, config: &KeelConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(config, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_execution(config, &mut result);
        self.validate_modules(config, &mut result);
        Self::validate_environments(config, &mut result);
        Self::validate_lock_lifetime(config, &mut result);

        result
    }

    /// Validates a configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error if validation fails.
    pub fn validate(&self, config: &KeelConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        match result.errors.first() {
            None => {
                debug!(warnings = result.warnings.len(), "Configuration validation passed");
                Ok(result)
            }
            Some(first) => Err(KeelError::Config(ConfigError::ValidationError {
                message: first.message.clone(),
                field: Some(first.field.clone()),
            })),
        }
    }

    /// Waits that can outlast the lock hold it only through background
    /// renewal; a stalled renewal then hands the environment to another run.
    fn validate_lock_lifetime(config: &KeelConfig, result: &mut ValidationResult) {
        let ttl = config.state.lock_ttl_secs;
        if ttl == 0 {
            return;
        }

        let step_timeout = config.execution.step_timeout_secs;
        if step_timeout >= ttl {
            result.warnings.push(format!(
                "execution.step_timeout_secs ({step_timeout}) is not below state.lock_ttl_secs \
                 ({ttl}); long steps rely on the lock being renewed while they run"
            ));
        }

        for (i, env) in config.environments.iter().enumerate() {
            if env.approval == ApprovalMode::Manual && env.approval_timeout_secs >= ttl {
                result.warnings.push(format!(
                    "environments[{i}].approval_timeout_secs ({}) is not below \
                     state.lock_ttl_secs ({ttl}); pending approvals rely on the lock being \
                     renewed while they wait",
                    env.approval_timeout_secs
                ));
            }
        }
    }

    fn validate_project(config: &KeelConfig, result: &mut ValidationResult) {
        let name = &config.project.name;
        if name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{name}' is invalid. Must be lowercase alphanumeric with hyphens."
                ),
            );
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }

        if state.lock_ttl_secs == 0 {
            result.error("state.lock_ttl_secs", "Lock TTL must be at least 1 second");
        }
    }

    fn validate_execution(config: &KeelConfig, result: &mut ValidationResult) {
        if config.execution.step_timeout_secs == 0 {
            result.error(
                "execution.step_timeout_secs",
                "Step timeout must be at least 1 second",
            );
        }

        for (kind, provisioner) in &config.provisioners {
            if let super::spec::ProvisionerConfig::Http {
                endpoint,
                timeout_secs,
                ..
            } = provisioner
            {
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                    result.error(
                        format!("provisioners.{kind}.endpoint"),
                        format!("Endpoint '{endpoint}' must be an http(s) URL"),
                    );
                }
                if *timeout_secs == 0 {
                    result.error(
                        format!("provisioners.{kind}.timeout_secs"),
                        "Request timeout must be at least 1 second",
                    );
                }
            }
        }
    }

    fn validate_modules(&self, config: &KeelConfig, result: &mut ValidationResult) {
        if config.modules.is_empty() {
            result
                .warnings
                .push(String::from("No modules defined in configuration"));
            return;
        }

        let declared: HashMap<&str, &ModuleConfig> = config
            .modules
            .iter()
            .map(|m| (m.name.as_str(), m))
            .collect();
        let mut seen_names = HashSet::new();

        for (i, module) in config.modules.iter().enumerate() {
            let prefix = format!("modules[{i}]");

            if !seen_names.insert(module.name.as_str()) {
                result.error(
                    format!("{prefix}.name"),
                    format!("Duplicate module name: {}", module.name),
                );
            }

            if !is_valid_name(&module.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Module name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        module.name
                    ),
                );
            }

            if module.kind.is_empty() {
                result.error(format!("{prefix}.kind"), "Module kind cannot be empty");
            } else if !config.provisioners.contains_key(&module.kind) {
                let message = format!(
                    "No provisioner configured for kind '{}' (module '{}')",
                    module.kind, module.name
                );
                if self.strict_kinds {
                    result.error(format!("{prefix}.kind"), message);
                } else {
                    result.warnings.push(format!("{prefix}.kind: {message}"));
                }
            }

            for dep in &module.depends_on {
                if dep == &module.name {
                    result.error(
                        format!("{prefix}.depends_on"),
                        format!("Module '{}' depends on itself", module.name),
                    );
                } else if !declared.contains_key(dep.as_str()) {
                    result.error(
                        format!("{prefix}.depends_on"),
                        format!("Module '{}' depends on unknown module '{dep}'", module.name),
                    );
                }
            }

            let mut seen_outputs = HashSet::new();
            for output in &module.outputs {
                if !seen_outputs.insert(output.as_str()) {
                    result.error(
                        format!("{prefix}.outputs"),
                        format!("Duplicate output '{output}' on module '{}'", module.name),
                    );
                }
            }

            Self::validate_inputs(&module.inputs, &format!("{prefix}.inputs"), &declared, result);
        }
    }

    fn validate_inputs(
        inputs: &BTreeMap<String, InputValue>,
        prefix: &str,
        declared: &HashMap<&str, &ModuleConfig>,
        result: &mut ValidationResult,
    ) {
        for (key, input) in inputs {
            let InputValue::Output(reference) = input else {
                continue;
            };
            let field = format!("{prefix}.{key}");
            match reference.target() {
                None => result.error(
                    field,
                    format!("Output reference '{reference}' must be of the form module.output"),
                ),
                Some((module, output)) => match declared.get(module) {
                    None => result.error(
                        field,
                        format!("Output reference '{reference}' names unknown module '{module}'"),
                    ),
                    Some(target) if !target.outputs.iter().any(|o| o == output) => result.error(
                        field,
                        format!("Module '{module}' does not declare output '{output}'"),
                    ),
                    Some(_) => {}
                },
            }
        }
    }

    fn validate_environments(config: &KeelConfig, result: &mut ValidationResult) {
        if config.environments.is_empty() {
            result
                .warnings
                .push(String::from("No environments defined in configuration"));
            return;
        }

        let declared: HashMap<&str, &ModuleConfig> = config
            .modules
            .iter()
            .map(|m| (m.name.as_str(), m))
            .collect();
        let mut seen_names = HashSet::new();
        let mut branches: HashMap<&str, &str> = HashMap::new();

        for (i, env) in config.environments.iter().enumerate() {
            let prefix = format!("environments[{i}]");

            if !seen_names.insert(env.name.as_str()) {
                result.error(
                    format!("{prefix}.name"),
                    format!("Duplicate environment name: {}", env.name),
                );
            }
            if !is_valid_name(&env.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Environment name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        env.name
                    ),
                );
            }

            let branch = env.branch.strip_prefix("refs/heads/").unwrap_or(&env.branch);
            if branch.is_empty() {
                result.error(format!("{prefix}.branch"), "Trigger branch cannot be empty");
            } else if let Some(first) = branches.insert(branch, env.name.as_str()) {
                result.error(
                    format!("{prefix}.branch"),
                    ConfigError::DuplicateBranch {
                        branch: branch.to_string(),
                        first: first.to_string(),
                        second: env.name.clone(),
                    }
                    .to_string(),
                );
            }

            if env.approval_timeout_secs == 0 {
                result.error(
                    format!("{prefix}.approval_timeout_secs"),
                    "Approval timeout must be at least 1 second",
                );
            }

            Self::validate_environment_modules(env, &prefix, &config.modules, &declared, result);
        }
    }

    fn validate_environment_modules(
        env: &EnvironmentConfig,
        prefix: &str,
        modules: &[ModuleConfig],
        declared: &HashMap<&str, &ModuleConfig>,
        result: &mut ValidationResult,
    ) {
        for name in &env.exclude {
            if !declared.contains_key(name.as_str()) {
                result.error(
                    format!("{prefix}.exclude"),
                    format!("Excluded module '{name}' is not declared"),
                );
            }
        }

        for (name, overrides) in &env.overrides {
            if !declared.contains_key(name.as_str()) {
                result.error(
                    format!("{prefix}.overrides.{name}"),
                    format!("Override targets unknown module '{name}'"),
                );
                continue;
            }
            if env.exclude.contains(name) {
                result.warnings.push(format!(
                    "{prefix}.overrides.{name}: module is excluded, override has no effect"
                ));
            }
            Self::validate_inputs(
                overrides,
                &format!("{prefix}.overrides.{name}"),
                declared,
                result,
            );
        }

        // A deployed module must not depend on an excluded one, after overrides.
        for module in modules {
            if env.exclude.contains(&module.name) {
                continue;
            }
            let mut inputs = module.inputs.clone();
            if let Some(overrides) = env.overrides.get(&module.name) {
                inputs.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            let deps = super::spec::effective_dependencies(&module.depends_on, inputs.values());
            for dep in deps.iter().filter(|d| env.exclude.contains(d)) {
                result.error(
                    format!("{prefix}.exclude"),
                    format!(
                        "Module '{}' is deployed to '{}' but depends on excluded module '{dep}'",
                        module.name, env.name
                    ),
                );
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> KeelConfig {
        serde_yaml::from_str(yaml).expect("test config should parse")
    }

    const BASE: &str = r"
project:
  name: shop
provisioners:
  network: { driver: echo }
  cluster: { driver: echo }
modules:
  - name: network
    kind: network
    outputs: [vpc_id]
  - name: cluster
    kind: cluster
    inputs:
      vpc: { from_output: network.vpc_id }
execution:
  step_timeout_secs: 120
environments:
  - name: staging
    branch: develop
  - name: prod
    branch: refs/heads/main
";

    fn messages(result: &ValidationResult) -> Vec<String> {
        result.errors.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("network"));
        assert!(is_valid_name("node-pool-2"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Network"));
        assert!(!is_valid_name("2-pool"));
        assert!(!is_valid_name("node_pool"));
        assert!(!is_valid_name("pool-"));
        assert!(!is_valid_name("node--pool"));
    }

    #[test]
    fn test_valid_config_passes() {
        let result = ConfigValidator::new().check(&parse(BASE));
        assert!(result.is_valid(), "unexpected errors: {:?}", messages(&result));
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_unknown_dependency_and_undeclared_output() {
        let mut config = parse(BASE);
        config.modules[1].depends_on.push(String::from("storage"));
        config.modules[1]
            .inputs
            .insert(String::from("sg"), InputValue::output("network", "sg_id"));

        let result = ConfigValidator::new().check(&config);
        let errors = messages(&result);
        assert_eq!(result.error_count(), 2, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("unknown module 'storage'")));
        assert!(errors.iter().any(|e| e.contains("does not declare output 'sg_id'")));
    }

    #[test]
    fn test_duplicate_branch_after_prefix_strip() {
        let mut config = parse(BASE);
        config.environments[0].branch = String::from("main");

        let result = ConfigValidator::new().check(&config);
        assert!(messages(&result)
            .iter()
            .any(|e| e.contains("Branch 'main' is mapped to both 'staging' and 'prod'")));
    }

    #[test]
    fn test_excluding_a_dependency_is_an_error() {
        let mut config = parse(BASE);
        config.environments[0].exclude.push(String::from("network"));

        let result = ConfigValidator::new().check(&config);
        assert!(messages(&result)
            .iter()
            .any(|e| e.contains("depends on excluded module 'network'")));
    }

    #[test]
    fn test_override_for_unknown_module() {
        let mut config = parse(BASE);
        config.environments[1]
            .overrides
            .insert(String::from("dns"), BTreeMap::new());

        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(err.to_string().contains("unknown module 'dns'"));
    }

    #[test]
    fn test_missing_provisioner_warns_unless_strict() {
        let mut config = parse(BASE);
        config.provisioners.remove("cluster");

        let lenient = ConfigValidator::new().check(&config);
        assert!(lenient.is_valid());
        assert_eq!(lenient.warning_count(), 1);

        let strict = ConfigValidator::new().strict_kinds(true).check(&config);
        assert_eq!(strict.error_count(), 1);
    }

    #[test]
    fn test_s3_without_bucket_and_zero_timeouts() {
        let mut config = parse(BASE);
        config.state.backend = StateBackend::S3;
        config.execution.step_timeout_secs = 0;
        config.state.lock_ttl_secs = 0;

        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"state.bucket"));
        assert!(fields.contains(&"state.lock_ttl_secs"));
        assert!(fields.contains(&"execution.step_timeout_secs"));
    }

    #[test]
    fn test_waits_longer_than_the_lock_ttl_warn() {
        let mut config = parse(BASE);
        config.execution.step_timeout_secs = 1800;
        config.environments[1].approval = ApprovalMode::Manual;
        config.environments[1].approval_timeout_secs = 3600;

        let result = ConfigValidator::new().check(&config);
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 2, "{:?}", result.warnings);
        assert!(result.warnings[0].starts_with("execution.step_timeout_secs (1800)"));
        assert!(result.warnings[1].starts_with("environments[1].approval_timeout_secs (3600)"));

        // auto environments never wait for approval
        config.environments[1].approval = ApprovalMode::Auto;
        config.execution.step_timeout_secs = 299;
        assert_eq!(ConfigValidator::new().check(&config).warning_count(), 0);
    }
}
