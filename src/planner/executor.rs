//! Plan executor.
//!
//! Steps run strictly in plan order, one at a time. On the first failure the
//! executor stops and hands back everything it did, including the partially
//! updated snapshot. Nothing is rolled back.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Fingerprinter;
use crate::error::{ProvisionError, Result};
use crate::provision::{
    DestroyRequest, ProvisionAction, ProvisionRequest, ProvisionerRegistry, StepResult,
};
use crate::state::{ModuleState, StateSnapshot};

use super::plan::{ActionType, ChangePlan, PlannedAction};

/// Default per-step timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(1800);

/// Notified after every applied step.
///
/// Returning an error halts the apply before the next step; the reconciler
/// uses this to renew the environment lock.
#[async_trait]
pub trait StepObserver: Send + Sync {
    /// Called once a step has been applied to the working snapshot.
    async fn step_applied(&self, step: &AppliedStep) -> Result<()>;
}

/// A step that completed.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AppliedStep {
    /// Module identifier.
    pub module: String,
    /// What was done.
    pub action: ActionType,
    /// Fingerprint recorded for the module (none for deletes).
    pub fingerprint: Option<String>,
    /// Outputs returned by the provisioner.
    pub outputs: BTreeMap<String, Value>,
    /// Wall-clock duration of the call.
    pub duration_ms: u64,
}

/// Result of a fully applied plan.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// The snapshot with every step applied.
    pub snapshot: StateSnapshot,
    /// Steps in the order they ran.
    pub applied: Vec<AppliedStep>,
}

/// Why an apply stopped early.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HaltCause {
    /// A provisioning step failed.
    #[error("step '{module}' failed: {error}")]
    StepFailed {
        /// Module whose step failed.
        module: String,
        /// The provisioner error.
        #[serde(serialize_with = "serialize_display")]
        error: ProvisionError,
    },

    /// Cancellation was requested between steps.
    #[error("cancelled")]
    Cancelled,

    /// A step observer refused to continue.
    #[error("interrupted: {reason}")]
    Interrupted {
        /// Observer's reason.
        reason: String,
    },
}

/// An apply that stopped before completing.
///
/// Carries everything applied so far and the working snapshot containing
/// exactly those steps, so the caller can commit it.
#[derive(Debug, Clone, Serialize)]
pub struct PartialApplyError {
    /// Environment being applied.
    pub environment: String,
    /// Steps that completed, in order.
    pub applied: Vec<AppliedStep>,
    /// Why the apply stopped.
    pub cause: HaltCause,
    /// Modules whose steps never ran.
    pub remaining: Vec<String>,
    /// The snapshot with the applied steps folded in.
    #[serde(skip)]
    pub snapshot: StateSnapshot,
    /// Set by the caller if committing `snapshot` failed too.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_error: Option<String>,
}

impl std::fmt::Display for PartialApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Apply to '{}' halted after {} step(s): {}",
            self.environment,
            self.applied.len(),
            self.cause
        )?;
        if !self.remaining.is_empty() {
            write!(f, "; not applied: {}", self.remaining.join(", "))?;
        }
        if let Some(commit_error) = &self.commit_error {
            write!(f, "; state commit also failed: {commit_error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for PartialApplyError {}

impl PartialApplyError {
    /// Module whose step failed, if the cause was a step failure.
    #[must_use]
    pub fn failed_module(&self) -> Option<&str> {
        match &self.cause {
            HaltCause::StepFailed { module, .. } => Some(module),
            _ => None,
        }
    }
}

fn serialize_display<S: serde::Serializer>(
    value: &ProvisionError,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Executor for change plans.
#[derive(Clone)]
pub struct PlanExecutor {
    registry: ProvisionerRegistry,
    step_timeout: Duration,
    observer: Option<Arc<dyn StepObserver>>,
    fingerprinter: Fingerprinter,
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("registry", &self.registry)
            .field("step_timeout", &self.step_timeout)
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl PlanExecutor {
    /// Creates a new plan executor.
    #[must_use]
    pub const fn new(registry: ProvisionerRegistry) -> Self {
        Self {
            registry,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            observer: None,
            fingerprinter: Fingerprinter::new(),
        }
    }

    /// Sets the per-step timeout.
    #[must_use]
    pub const fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Installs an observer notified after every step.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Applies `plan` on top of `base`.
    ///
    /// Cancellation is checked before each step, never during one.
    ///
    /// # Errors
    ///
    /// Returns a [`PartialApplyError`] if a step fails, cancellation is
    /// requested, or the observer halts the apply.
    pub async fn apply(
        &self,
        plan: &ChangePlan,
        base: StateSnapshot,
        cancel: &CancellationToken,
    ) -> std::result::Result<ApplyOutcome, PartialApplyError> {
        let steps: Vec<&PlannedAction> = plan.steps().collect();
        info!(
            environment = %plan.environment,
            steps = steps.len(),
            "Applying change plan"
        );

        let mut snapshot = base;
        let mut applied = Vec::with_capacity(steps.len());

        for (idx, action) in steps.iter().enumerate() {
            let remaining_from = |from: usize| -> Vec<String> {
                steps[from..].iter().map(|a| a.module.clone()).collect()
            };

            if cancel.is_cancelled() {
                warn!(environment = %plan.environment, module = %action.module, "Apply cancelled");
                return Err(PartialApplyError {
                    environment: plan.environment.clone(),
                    applied,
                    cause: HaltCause::Cancelled,
                    remaining: remaining_from(idx),
                    snapshot,
                    commit_error: None,
                });
            }

            info!("Step {}/{}: {}", idx + 1, steps.len(), action.description());
            let result = self.run_step(&plan.environment, action, &mut snapshot).await;
            let step = match result {
                Ok(step) => step,
                Err(err) => {
                    error!(module = %action.module, "Step failed: {err}");
                    return Err(PartialApplyError {
                        environment: plan.environment.clone(),
                        applied,
                        cause: HaltCause::StepFailed {
                            module: action.module.clone(),
                            error: err,
                        },
                        remaining: remaining_from(idx + 1),
                        snapshot,
                        commit_error: None,
                    });
                }
            };

            let observed = match &self.observer {
                Some(observer) => observer.step_applied(&step).await,
                None => Ok(()),
            };
            applied.push(step);

            if let Err(err) = observed {
                warn!(module = %action.module, "Apply interrupted: {err}");
                return Err(PartialApplyError {
                    environment: plan.environment.clone(),
                    applied,
                    cause: HaltCause::Interrupted {
                        reason: err.to_string(),
                    },
                    remaining: remaining_from(idx + 1),
                    snapshot,
                    commit_error: None,
                });
            }
        }

        info!(environment = %plan.environment, applied = applied.len(), "Change plan applied");
        Ok(ApplyOutcome { snapshot, applied })
    }

    async fn run_step(
        &self,
        environment: &str,
        action: &PlannedAction,
        snapshot: &mut StateSnapshot,
    ) -> StepResult<AppliedStep> {
        let started = Instant::now();
        let step = match action.action {
            ActionType::Create | ActionType::Update => {
                self.provision(environment, action, snapshot).await?
            }
            ActionType::Delete => self.destroy(environment, action, snapshot).await?,
            ActionType::Noop => return Err(ProvisionError::failed("no-op is not a step")),
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(AppliedStep { duration_ms, ..step })
    }

    async fn provision(
        &self,
        environment: &str,
        action: &PlannedAction,
        snapshot: &mut StateSnapshot,
    ) -> StepResult<AppliedStep> {
        let provisioner = self.registry.get(&action.kind)?;

        let inputs = action
            .resolve_inputs(|m, o| snapshot.output(m, o).cloned())
            .map_err(|r| ProvisionError::UnresolvedInput {
                module: action.module.clone(),
                input: r.input,
                reference: r.reference,
            })?;
        let fingerprint = self.fingerprinter.fingerprint(&action.kind, &inputs);

        if let Some(planned) = &action.desired_fingerprint
            && planned != &fingerprint
        {
            debug!(module = %action.module, "Fingerprint differs from plan time");
        }

        let request = ProvisionRequest {
            environment: environment.to_string(),
            module: action.module.clone(),
            kind: action.kind.clone(),
            action: if action.action == ActionType::Create {
                ProvisionAction::Create
            } else {
                ProvisionAction::Update
            },
            inputs,
            prior_fingerprint: snapshot.module(&action.module).map(|m| m.fingerprint.clone()),
            fingerprint: fingerprint.clone(),
            declared_outputs: action.outputs.clone(),
        };

        let output = tokio::time::timeout(self.step_timeout, provisioner.apply(&request))
            .await
            .map_err(|_| ProvisionError::Timeout {
                module: action.module.clone(),
                after_secs: self.step_timeout.as_secs(),
            })??;

        let missing = output.missing(&action.outputs);
        if !missing.is_empty() {
            return Err(ProvisionError::MissingOutputs {
                module: action.module.clone(),
                missing: missing.into_iter().map(String::from).collect(),
            });
        }

        if let Some(reported) = &output.fingerprint
            && reported != &fingerprint
        {
            warn!(
                module = %action.module,
                reported = %Fingerprinter::short_hash(reported),
                computed = %Fingerprinter::short_hash(&fingerprint),
                "Provisioner reported a different fingerprint, recording computed one"
            );
        }

        snapshot.set_module(
            &action.module,
            ModuleState::new(&action.kind, &fingerprint, output.outputs.clone())
                .with_dependencies(action.depends_on.clone()),
        );

        Ok(AppliedStep {
            module: action.module.clone(),
            action: action.action,
            fingerprint: Some(fingerprint),
            outputs: output.outputs,
            duration_ms: 0,
        })
    }

    async fn destroy(
        &self,
        environment: &str,
        action: &PlannedAction,
        snapshot: &mut StateSnapshot,
    ) -> StepResult<AppliedStep> {
        let Some(prior) = snapshot.module(&action.module).cloned() else {
            debug!(module = %action.module, "Already absent from state");
            return Ok(AppliedStep {
                module: action.module.clone(),
                action: ActionType::Delete,
                fingerprint: None,
                outputs: BTreeMap::new(),
                duration_ms: 0,
            });
        };

        let provisioner = self.registry.get(&prior.kind)?;
        let request = DestroyRequest {
            environment: environment.to_string(),
            module: action.module.clone(),
            kind: prior.kind.clone(),
            prior_outputs: prior.outputs.clone(),
            prior_fingerprint: prior.fingerprint.clone(),
        };

        tokio::time::timeout(self.step_timeout, provisioner.destroy(&request))
            .await
            .map_err(|_| ProvisionError::Timeout {
                module: action.module.clone(),
                after_secs: self.step_timeout.as_secs(),
            })??;

        snapshot.remove_module(&action.module);
        Ok(AppliedStep {
            module: action.module.clone(),
            action: ActionType::Delete,
            fingerprint: None,
            outputs: prior.outputs,
            duration_ms: 0,
        })
    }
}
