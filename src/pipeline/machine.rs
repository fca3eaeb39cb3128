//! Pipeline state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::PipelineError;

/// Where an environment's pipeline is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Waiting for an event.
    #[default]
    Idle,
    /// Loading configuration, locking and planning.
    Planning,
    /// Plan computed, waiting for the approval gate.
    AwaitingApproval,
    /// Executing the plan.
    Applying,
    /// The plan was fully applied.
    Succeeded,
    /// The cycle ended early.
    Failed,
}

impl PipelineState {
    /// Returns true for states that end a cycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns true if `self → next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Planning)
                | (Self::Planning, Self::AwaitingApproval | Self::Failed)
                | (Self::AwaitingApproval, Self::Applying | Self::Failed)
                | (Self::Applying, Self::Succeeded | Self::Failed)
                | (Self::Succeeded | Self::Failed, Self::Idle)
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Applying => "applying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A recorded state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    /// State left.
    pub from: PipelineState,
    /// State entered.
    pub to: PipelineState,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Tracks one cycle's progress and rejects illegal moves.
#[derive(Debug, Clone, Default)]
pub struct PipelineMachine {
    state: PipelineState,
    transitions: Vec<Transition>,
}

impl PipelineMachine {
    /// Creates a machine in [`PipelineState::Idle`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> PipelineState {
        self.state
    }

    /// Transitions taken so far.
    #[must_use]
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidTransition`] if the move is not allowed;
    /// the state is left unchanged.
    pub fn transition(&mut self, next: PipelineState) -> Result<(), PipelineError> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.transitions.push(Transition {
            from: self.state,
            to: next,
            at: Utc::now(),
        });
        self.state = next;
        Ok(())
    }

    /// Moves to [`PipelineState::Failed`] unless the cycle already ended.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() && self.state.can_transition_to(PipelineState::Failed) {
            let _ = self.transition(PipelineState::Failed);
        }
    }
}
