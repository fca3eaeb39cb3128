// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(unused_must_use)]
#![deny(nonstandard_style)]
#![forbid(unsafe_op_in_unsafe_fn)]

// Clippy lints (warnings only)
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::panic)]
#![warn(clippy::print_stdout)]
#![warn(clippy::todo)]
#![warn(clippy::unimplemented)]
#![warn(clippy::unwrap_in_result)]
#![warn(clippy::redundant_clone)]
#![warn(clippy::shadow_unrelated)]
#![warn(clippy::cognitive_complexity)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]
#![deny(arithmetic_overflow)]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # keel
//!
//! Declarative, lock-guarded infrastructure reconciliation with
//! branch-gated promotion.
//!
//! A project declares **modules** (units of infrastructure with inputs,
//! outputs and dependencies) and **environments** (each with its own state,
//! trigger branch and approval policy). A reconciliation cycle:
//!
//! 1. builds the dependency graph and its execution order,
//! 2. locks the environment's state and loads the last committed snapshot,
//! 3. plans creates, updates and deletes by comparing input fingerprints,
//! 4. applies the plan step by step through a provisioner per module kind,
//! 5. commits the new snapshot (or the partial one, if a step failed) and
//!    releases the lock.
//!
//! ## Modules
//!
//! - [`config`]: configuration parsing, validation and fingerprints
//! - [`graph`]: dependency graph and execution order
//! - [`state`]: snapshots and locking (memory, local, S3)
//! - [`provision`]: provisioning capabilities per module kind
//! - [`planner`]: change plans and their execution
//! - [`reconciler`]: one lock-guarded cycle per environment
//! - [`pipeline`]: branch-triggered plan, approve, apply pipelines
//! - [`cli`]: command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: shop
//!
//! provisioners:
//!   net: { driver: echo }
//!   k8s: { driver: http, endpoint: "https://provisioner.internal/k8s" }
//!
//! modules:
//!   - name: network
//!     kind: net
//!     inputs: { cidr: 10.0.0.0/16 }
//!     outputs: [vpc_id]
//!   - name: cluster
//!     kind: k8s
//!     inputs:
//!       vpc: { from_output: network.vpc_id }
//!     outputs: [endpoint]
//!
//! environments:
//!   - name: staging
//!     branch: develop
//!   - name: prod
//!     branch: main
//!     approval: manual
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod pipeline;
pub mod planner;
pub mod provision;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigParser, ConfigValidator, DesiredConfiguration, Fingerprinter, KeelConfig};
pub use error::{KeelError, Result};
pub use graph::{ExecutionOrder, ResourceGraph};
pub use pipeline::{EnvironmentPipeline, PipelineDispatcher, SourceEvent};
pub use planner::{ChangePlan, PlanExecutor, Planner};
pub use provision::{Provisioner, ProvisionerRegistry};
pub use reconciler::{CycleOutcome, Reconciler};
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, StateSnapshot, StateStore};
