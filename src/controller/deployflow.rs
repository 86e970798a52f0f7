//! DeployFlow rollout controller
//!
//! A pass runs the pipeline below once, in order:
//!
//! 1. [`strategy::normalize`] merges the Action's strategy into one
//!    effective strategy
//! 2. [`observe::Observation::capture`] reads the CloneSet and its pods
//! 3. [`engine::decide`] advances the batch state machine one step
//! 4. [`actuator::plan_actuations`] and [`actuator::apply`] steer the
//!    CloneSet and pull pods in or out
//! 5. [`status::record`] folds the observation into the new status
//!
//! [`reconcile::reconcile`] wraps the pass with the fresh read and the
//! conditional status write.

pub mod actuator;
pub mod engine;
pub mod observe;
pub mod planner;
pub mod reconcile;
pub mod status;
pub mod strategy;
pub mod validation;
pub mod workload;

pub use engine::ProgressionTimings;
pub use reconcile::{error_policy, reconcile, run_pass, Context, PassOutcome, ReconcileError};
pub use validation::{validate_spec, validate_update, ValidationError};
pub use workload::{KubeWorkloadClient, WorkloadClient, WorkloadError};

#[cfg(test)]
#[path = "deployflow_test.rs"]
mod tests;
