//! One environment's pipeline: event → plan → approval → apply.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::{ConfigValidator, DesiredConfiguration, Fingerprinter};
use crate::error::{KeelError, Result};
use crate::planner::{AppliedStep, ChangePlan, PartialApplyError};
use crate::reconciler::{PreparedCycle, Reconciler};

use super::approval::ApprovalGate;
use super::machine::{PipelineMachine, PipelineState, Transition};
use super::source::{ConfigSource, SourceEvent};

/// Operator-facing result of one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    /// Environment the cycle ran for.
    pub environment: String,
    /// The event that triggered it.
    pub event: SourceEvent,
    /// Final pipeline state.
    pub state: PipelineState,
    /// States passed through.
    pub transitions: Vec<Transition>,
    /// The plan, if planning got that far.
    pub plan: Option<ChangePlan>,
    /// Steps that were applied.
    pub applied: Vec<AppliedStep>,
    /// Why the cycle failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Detail of an apply that stopped early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialApplyError>,
    /// When the cycle started.
    pub started_at: DateTime<Utc>,
    /// When the cycle ended.
    pub finished_at: DateTime<Utc>,
}

impl CycleReport {
    /// Returns true if the cycle succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Succeeded
    }
}

/// Runs cycles for one environment.
pub struct EnvironmentPipeline {
    environment: String,
    reconciler: Reconciler,
    gate: Arc<dyn ApprovalGate>,
    source: Arc<dyn ConfigSource>,
    state_tx: watch::Sender<PipelineState>,
}

impl std::fmt::Debug for EnvironmentPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentPipeline")
            .field("environment", &self.environment)
            .field("state", &*self.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl EnvironmentPipeline {
    /// Creates a pipeline for the reconciler's environment.
    #[must_use]
    pub fn new(
        reconciler: Reconciler,
        gate: Arc<dyn ApprovalGate>,
        source: Arc<dyn ConfigSource>,
    ) -> Self {
        let (state_tx, _) = watch::channel(PipelineState::Idle);
        Self {
            environment: reconciler.environment().to_string(),
            reconciler,
            gate,
            source,
            state_tx,
        }
    }

    /// Environment name.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Watches the pipeline state.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state_tx.subscribe()
    }

    /// Runs one full cycle for `event` and returns its report.
    ///
    /// The pipeline is back at [`PipelineState::Idle`] when this returns.
    pub async fn run(&self, event: SourceEvent, cancel: &CancellationToken) -> CycleReport {
        let span = info_span!("cycle", environment = %self.environment, commit = %event.commit);
        self.run_inner(event, cancel).instrument(span).await
    }

    async fn run_inner(&self, event: SourceEvent, cancel: &CancellationToken) -> CycleReport {
        let started_at = Utc::now();
        let mut machine = PipelineMachine::new();
        let mut report = CycleReport {
            environment: self.environment.clone(),
            event: event.clone(),
            state: PipelineState::Idle,
            transitions: Vec::new(),
            plan: None,
            applied: Vec::new(),
            error: None,
            partial: None,
            started_at,
            finished_at: started_at,
        };

        info!(%event, "Cycle started");
        if let Err(err) = self.drive(&event, cancel, &mut machine, &mut report).await {
            error!("Cycle failed: {err}");
            if let Some(partial) = err.partial_apply() {
                report.applied.clone_from(&partial.applied);
                report.partial = Some(partial.clone());
            }
            report.error = Some(err.to_string());
            machine.fail();
            self.publish(&machine);
        }

        report.state = machine.state();
        report.transitions = machine.transitions().to_vec();
        report.finished_at = Utc::now();
        info!(state = %report.state, applied = report.applied.len(), "Cycle finished");

        self.state_tx.send_replace(PipelineState::Idle);
        report
    }

    async fn drive(
        &self,
        event: &SourceEvent,
        cancel: &CancellationToken,
        machine: &mut PipelineMachine,
        report: &mut CycleReport,
    ) -> Result<()> {
        self.advance(machine, PipelineState::Planning)?;
        let prepared = self.plan(event).await?;
        report.plan = Some(prepared.plan().clone());

        self.advance(machine, PipelineState::AwaitingApproval)?;
        if prepared.plan().has_changes() {
            if let Err(err) = self.gate.approve(prepared.plan(), cancel).await {
                prepared.abandon().await;
                return Err(err.into());
            }
        } else {
            info!("No changes, skipping approval");
        }

        self.advance(machine, PipelineState::Applying)?;
        let outcome = prepared.apply(cancel, Some(event.commit.clone())).await?;
        report.applied = outcome.applied;

        self.advance(machine, PipelineState::Succeeded)?;
        Ok(())
    }

    async fn plan(&self, event: &SourceEvent) -> Result<PreparedCycle> {
        let config = self.source.load(event).await?;
        let validation = ConfigValidator::new().validate(&config)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }

        let desired = DesiredConfiguration::for_environment(&config, &self.environment)?;
        let hash = Fingerprinter::new().hash_config(&config);
        Ok(self.reconciler.prepare(&desired).await?.with_config_hash(hash))
    }

    fn advance(&self, machine: &mut PipelineMachine, next: PipelineState) -> Result<()> {
        machine.transition(next).map_err(KeelError::from)?;
        self.publish(machine);
        Ok(())
    }

    fn publish(&self, machine: &PipelineMachine) {
        self.state_tx.send_replace(machine.state());
    }
}
