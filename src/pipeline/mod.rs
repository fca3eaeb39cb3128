//! Branch-triggered promotion pipeline.
//!
//! Source-control events are routed to environments by branch. Each
//! environment runs its own [`EnvironmentPipeline`] one cycle at a time:
//! plan, wait for approval, apply. The [`PipelineDispatcher`] keeps at most
//! one pending event per environment.

mod approval;
mod controller;
mod dispatcher;
mod machine;
mod routing;
mod source;

pub use approval::{
    ApprovalDecision, ApprovalGate, ApprovalHandle, AutoApprove, ManualApproval, gate_for,
};
pub use controller::{CycleReport, EnvironmentPipeline};
pub use dispatcher::{Dispatch, PipelineDispatcher};
pub use machine::{PipelineMachine, PipelineState, Transition};
pub use routing::BranchRouter;
pub use source::{ConfigSource, FileConfigSource, SourceEvent, StaticConfigSource};
