//! # pe-daq
//!
//! Simulated Perkin-Elmer area-detector acquisition with file provenance
//! tracking. The workspace is split by concern:
//!
//! - **`daq-core`**: channel store, completion watchers, the single-flight
//!   acquisition controller, capability traits and run documents
//! - **`daq-storage`**: resource and datum bookkeeping for staged file series
//! - **`daq-driver-mock`**: the simulated detector (channel table, timing
//!   modes, error injection)
//! - **`daq-experiment`**: the dark-corrected count plan and the orchestrator
//!   that executes it
//!
//! This crate adds what a binary needs on top: layered configuration
//! ([`config`]) and tracing setup ([`logging`]).

pub mod config;
pub mod logging;

pub use daq_core::{
    capabilities::{Acquirable, AreaDetector, AssetRegistry, Configurable, Stageable},
    error::{AppResult, DaqError},
    experiment::Document,
};
pub use daq_driver_mock::{PerkinElmerConfig, PerkinElmerDetector};
pub use daq_experiment::{
    CountProtocol, CountSettings, OrchestratorConfig, RunOutcome, RunSummary, TriggerOrchestrator,
};

use std::sync::Arc;

/// Build the detector and orchestrator described by `config`.
pub fn build_orchestrator(
    config: &config::PeDaqConfig,
) -> AppResult<TriggerOrchestrator<PerkinElmerDetector>> {
    let detector = PerkinElmerDetector::from_config(&config.detector)?;
    Ok(TriggerOrchestrator::new(
        Arc::new(detector),
        config.orchestrator_config(),
    ))
}
