//! Deterministic Simulation Testing (DST) for the volkeep controller.
//!
//! This crate provides testing utilities that are intentionally separate from
//! `volkeep-csi` so simulated backends are never compiled into production
//! binaries.
//!
//! ## Crate Structure
//!
//! - `harness` - Simulation harnesses and oracles for correctness verification
//! - `simulation` - Runtime setup and simulation runners
//!
//! ## Running DST Tests
//!
//! ```bash
//! # PR-level quick tests
//! cargo test -p volkeep-dst simulation
//!
//! # Nightly long-running tests
//! cargo test -p volkeep-dst simulation -- --ignored
//!
//! # Reproduce a failure
//! DST_SEED=1234 cargo test -p volkeep-dst simulation
//! ```

pub mod harness;
pub mod simulation;

pub use harness::{
    BackendOp, BackendOracle, CallRecord, ControllerAction, ControllerHarness, ControllerStats,
    IntervalOracle, Outcome, SimBackend, SimulationError,
};
pub use simulation::{build_runtime, get_seed, run_controller_simulation};
