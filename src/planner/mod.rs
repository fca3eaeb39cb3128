//! Planning and execution of change plans.
//!
//! The [`Planner`] compares one environment's desired configuration with its
//! last-applied snapshot; the [`PlanExecutor`] carries the resulting plan out
//! step by step.

mod diff;
mod executor;
mod plan;

pub use diff::Planner;
pub use executor::{
    AppliedStep, ApplyOutcome, DEFAULT_STEP_TIMEOUT, HaltCause, PartialApplyError, PlanExecutor,
    StepObserver,
};
pub use plan::{ActionType, ChangePlan, PlannedAction};
