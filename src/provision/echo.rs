//! Deterministic local provisioner.
//!
//! Echo produces every declared output as a string derived from the module
//! name and its input fingerprint. Nothing leaves the process, which makes it
//! useful for dry runs and for exercising pipelines end to end.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::Fingerprinter;

use super::{DestroyRequest, ProvisionOutput, ProvisionRequest, Provisioner, StepResult};

/// Provisioner that fabricates outputs locally.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoProvisioner;

impl EchoProvisioner {
    /// Creates an echo provisioner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provisioner for EchoProvisioner {
    async fn apply(&self, request: &ProvisionRequest) -> StepResult<ProvisionOutput> {
        let short = Fingerprinter::short_hash(&request.fingerprint);
        let outputs = request
            .declared_outputs
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    Value::String(format!("{}-{name}-{short}", request.module)),
                )
            })
            .collect();

        debug!(module = %request.module, action = ?request.action, "Echo apply");
        Ok(ProvisionOutput {
            outputs,
            fingerprint: Some(request.fingerprint.clone()),
        })
    }

    async fn destroy(&self, request: &DestroyRequest) -> StepResult<()> {
        debug!(module = %request.module, "Echo destroy");
        Ok(())
    }

    fn driver(&self) -> &'static str {
        "echo"
    }
}
