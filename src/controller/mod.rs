pub mod clock;
pub mod deployflow;
pub mod registry;

pub use deployflow::{reconcile, Context, ReconcileError};
pub use registry::run_controllers;
