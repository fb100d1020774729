//! Simulation runners and utilities.
//!
//! Simulations run on a single-threaded runtime. Every task interleaving comes
//! from seeded yields inside the simulated backend, so a failing run can be
//! reproduced by setting `DST_SEED` to the seed it printed.

use crate::harness::{ControllerHarness, SimulationError};

/// Build a single-threaded tokio runtime for simulation.
pub fn build_runtime() -> Result<tokio::runtime::Runtime, SimulationError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| SimulationError::Unexpected(format!("failed to build runtime: {e}")))
}

/// Run a controller simulation with the given seed.
///
/// `volume_count` bounds the set of names requests pick from; fewer names mean
/// more contention on each one.
pub async fn run_controller_simulation(
    seed: u64,
    volume_count: usize,
    operations: u64,
    fault_percent: u32,
) -> Result<(), SimulationError> {
    eprintln!(
        "Controller simulation: seed={}, volumes={}, ops={}, faults={}%",
        seed, volume_count, operations, fault_percent
    );

    let mut harness = ControllerHarness::new(seed, volume_count, fault_percent)?;
    harness.run(operations, 16).await?;

    let stats = harness.stats();
    eprintln!("Controller simulation complete: {:?}", stats);
    Ok(())
}

/// Get the seed from environment or generate a random one.
pub fn get_seed() -> u64 {
    std::env::var("DST_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(rand::random)
}
