//! Simulation harnesses for the volkeep controller.
//!
//! Harnesses provide the infrastructure for running deterministic simulations:
//! - A recording backend that logs every call as a logical-time interval
//! - Oracles that check the log for overlap and replay it against a model
//! - Action generators for random request batches
//! - Statistics tracking

pub mod backend;
pub mod controller;

pub use backend::{BackendOp, BackendOracle, CallRecord, IntervalOracle, Outcome, SimBackend};
pub use controller::{ControllerAction, ControllerHarness, ControllerStats};

/// Error type for simulation failures.
#[derive(Debug)]
pub enum SimulationError {
    Mismatch { context: String },
    Unexpected(String),
}

impl std::fmt::Display for SimulationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mismatch { context } => write!(f, "oracle mismatch: {}", context),
            Self::Unexpected(msg) => write!(f, "unexpected error: {}", msg),
        }
    }
}

impl std::error::Error for SimulationError {}
