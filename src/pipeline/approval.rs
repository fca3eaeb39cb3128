//! Approval gates between planning and applying.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ApprovalMode, EnvironmentConfig};
use crate::error::PipelineError;
use crate::planner::ChangePlan;

/// Decides whether a plan may be applied.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Waits for a decision on `plan`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ApprovalRejected`] if the plan is rejected or
    /// no decision arrives in time, and [`PipelineError::Cancelled`] if
    /// `cancel` fires first.
    async fn approve(&self, plan: &ChangePlan, cancel: &CancellationToken)
    -> Result<(), PipelineError>;
}

/// Approves every plan immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn approve(
        &self,
        plan: &ChangePlan,
        _cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        debug!(environment = %plan.environment, "Plan auto-approved");
        Ok(())
    }
}

/// An operator's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Apply the pending plan.
    Approve,
    /// Discard the pending plan.
    Reject {
        /// Why.
        reason: String,
    },
}

/// Waits for an explicit signal sent through an [`ApprovalHandle`].
///
/// Decisions sent while no plan is pending are discarded when the next plan
/// starts waiting, so an approval always refers to a plan that was shown.
#[derive(Debug)]
pub struct ManualApproval {
    decisions: Mutex<mpsc::Receiver<ApprovalDecision>>,
    timeout: Duration,
}

/// Sends decisions to a [`ManualApproval`] gate.
#[derive(Debug, Clone)]
pub struct ApprovalHandle {
    tx: mpsc::Sender<ApprovalDecision>,
}

impl ManualApproval {
    /// Creates a gate and the handle that feeds it.
    #[must_use]
    pub fn channel(timeout: Duration) -> (Self, ApprovalHandle) {
        let (tx, rx) = mpsc::channel(8);
        (
            Self {
                decisions: Mutex::new(rx),
                timeout,
            },
            ApprovalHandle { tx },
        )
    }
}

#[async_trait]
impl ApprovalGate for ManualApproval {
    async fn approve(
        &self,
        plan: &ChangePlan,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut decisions = self.decisions.lock().await;
        while let Ok(stale) = decisions.try_recv() {
            warn!(environment = %plan.environment, ?stale, "Discarding decision sent before plan");
        }

        info!(
            environment = %plan.environment,
            timeout_secs = self.timeout.as_secs(),
            "Waiting for approval: {}",
            plan.summary()
        );

        let decision = tokio::select! {
            () = cancel.cancelled() => return Err(PipelineError::Cancelled),
            received = tokio::time::timeout(self.timeout, decisions.recv()) => received,
        };

        match decision {
            Ok(Some(ApprovalDecision::Approve)) => {
                info!(environment = %plan.environment, "Plan approved");
                Ok(())
            }
            Ok(Some(ApprovalDecision::Reject { reason })) => {
                Err(PipelineError::ApprovalRejected { reason })
            }
            Ok(None) => Err(PipelineError::ApprovalRejected {
                reason: String::from("approval channel closed"),
            }),
            Err(_) => Err(PipelineError::ApprovalRejected {
                reason: format!("no decision within {}s", self.timeout.as_secs()),
            }),
        }
    }
}

impl ApprovalHandle {
    /// Approves the pending plan.
    ///
    /// # Errors
    ///
    /// Returns an error if the gate has been dropped.
    pub async fn approve(&self) -> Result<(), PipelineError> {
        self.send(ApprovalDecision::Approve).await
    }

    /// Rejects the pending plan.
    ///
    /// # Errors
    ///
    /// Returns an error if the gate has been dropped.
    pub async fn reject(&self, reason: impl Into<String>) -> Result<(), PipelineError> {
        self.send(ApprovalDecision::Reject {
            reason: reason.into(),
        })
        .await
    }

    async fn send(&self, decision: ApprovalDecision) -> Result<(), PipelineError> {
        self.tx.send(decision).await.map_err(|_| PipelineError::Cancelled)
    }
}

/// Builds the gate an environment's `approval` setting asks for.
///
/// Returns the handle for manual gates.
#[must_use]
pub fn gate_for(
    environment: &EnvironmentConfig,
) -> (std::sync::Arc<dyn ApprovalGate>, Option<ApprovalHandle>) {
    match environment.approval {
        ApprovalMode::Auto => (std::sync::Arc::new(AutoApprove), None),
        ApprovalMode::Manual => {
            let (gate, handle) =
                ManualApproval::channel(Duration::from_secs(environment.approval_timeout_secs));
            (std::sync::Arc::new(gate), Some(handle))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> ChangePlan {
        ChangePlan::new("prod", Vec::new())
    }

    #[tokio::test]
    async fn test_manual_approval() {
        let (gate, handle) = ManualApproval::channel(Duration::from_secs(5));
        let approver = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.approve().await
        });

        gate.approve(&plan(), &CancellationToken::new())
            .await
            .expect("approved");
        approver.await.expect("join").expect("sent");
    }

    #[tokio::test]
    async fn test_rejection_carries_reason() {
        let (gate, handle) = ManualApproval::channel(Duration::from_secs(5));
        let rejecter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.reject("freeze window").await
        });

        let err = gate.approve(&plan(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ApprovalRejected { ref reason } if reason == "freeze window"));
        rejecter.await.expect("join").expect("sent");
    }

    #[tokio::test]
    async fn test_early_decision_is_discarded() {
        let (gate, handle) = ManualApproval::channel(Duration::from_millis(50));
        handle.approve().await.expect("sent");

        let err = gate.approve(&plan(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ApprovalRejected { .. }));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let (gate, _handle) = ManualApproval::channel(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = gate.approve(&plan(), &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
