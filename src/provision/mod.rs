//! Provisioning capabilities.
//!
//! keel never talks to a cloud API itself. Each module kind is handled by a
//! [`Provisioner`] that turns resolved inputs into outputs; the
//! [`ProvisionerRegistry`] maps kinds to capabilities.

mod echo;
mod http;
mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ProvisionError;

pub use echo::EchoProvisioner;
pub use http::HttpProvisioner;
pub use registry::ProvisionerRegistry;

/// Result of a single provisioning call.
pub type StepResult<T> = std::result::Result<T, ProvisionError>;

/// Whether the module is being created or changed in place.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionAction {
    /// No prior state exists.
    Create,
    /// Prior state exists and will be replaced.
    Update,
}

/// Request to create or update one module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisionRequest {
    /// Environment being reconciled.
    pub environment: String,
    /// Module identifier.
    pub module: String,
    /// Module kind.
    pub kind: String,
    /// Create or update.
    pub action: ProvisionAction,
    /// Fully resolved inputs.
    pub inputs: BTreeMap<String, Value>,
    /// Fingerprint recorded by the previous apply, if any.
    pub prior_fingerprint: Option<String>,
    /// Fingerprint of `inputs`.
    pub fingerprint: String,
    /// Outputs the module must return.
    pub declared_outputs: Vec<String>,
}

/// What a provisioner returns for a successful apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProvisionOutput {
    /// Realized outputs.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// The provisioner's own view of the input fingerprint.
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// Request to destroy one module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DestroyRequest {
    /// Environment being reconciled.
    pub environment: String,
    /// Module identifier.
    pub module: String,
    /// Module kind as recorded in state.
    pub kind: String,
    /// Outputs recorded by the last apply.
    pub prior_outputs: BTreeMap<String, Value>,
    /// Fingerprint recorded by the last apply.
    pub prior_fingerprint: String,
}

/// A provisioning capability for one or more module kinds.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Creates or updates a module and returns its outputs.
    async fn apply(&self, request: &ProvisionRequest) -> StepResult<ProvisionOutput>;

    /// Destroys a module.
    async fn destroy(&self, request: &DestroyRequest) -> StepResult<()>;

    /// Short driver name for reports.
    fn driver(&self) -> &'static str;
}

impl ProvisionOutput {
    /// Declared outputs absent from this result.
    #[must_use]
    pub fn missing<'a>(&self, declared: &'a [String]) -> Vec<&'a str> {
        declared
            .iter()
            .filter(|name| !self.outputs.contains_key(name.as_str()))
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_outputs() {
        let output = ProvisionOutput {
            outputs: BTreeMap::from([(String::from("vpc_id"), json!("vpc-1"))]),
            fingerprint: None,
        };
        let declared = vec![String::from("vpc_id"), String::from("subnet_ids")];
        assert_eq!(output.missing(&declared), vec!["subnet_ids"]);
    }

    #[test]
    fn test_output_accepts_missing_fingerprint() {
        let output: ProvisionOutput =
            serde_json::from_value(json!({ "outputs": { "endpoint": "https://k8s" } }))
                .expect("response parses");
        assert!(output.fingerprint.is_none());
        assert_eq!(output.outputs["endpoint"], json!("https://k8s"));
    }
}
