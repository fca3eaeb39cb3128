//! Configuration module for keel.
//!
//! This module handles all configuration-related functionality:
//! - Parsing `keel.yaml` and applying environment overrides
//! - Validating modules, references and environments
//! - Resolving the desired configuration for one environment
//! - Fingerprinting resolved inputs for change detection

mod desired;
mod hash;
mod parser;
mod spec;
mod validator;

pub use desired::{DesiredConfiguration, DesiredModule, UnresolvedReference};
pub(crate) use desired::resolve_input_map;
pub use hash::Fingerprinter;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    ApprovalMode, EnvironmentConfig, ExecutionConfig, InputValue, KeelConfig, ModuleConfig,
    OutputRef, ProjectConfig, ProvisionerConfig, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
