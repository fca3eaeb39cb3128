//! Module dependency graph.
//!
//! [`ResourceGraph`] collects modules and their dependencies and computes the
//! [`ExecutionOrder`] shared by the planner and the executor within a cycle.

mod dag;

pub use dag::{ExecutionOrder, ResourceGraph};
