//! Count plans and the trigger orchestrator
//!
//! [`plans`] describes what a run does as a stream of [`PlanCommand`]s;
//! [`orchestrator`] executes them against an
//! [`AreaDetector`](daq_core::capabilities::AreaDetector) and broadcasts the
//! run's documents.

pub mod orchestrator;
pub mod plans;

pub use orchestrator::{
    EngineState, OrchestratorConfig, RunOutcome, RunSummary, TriggerOrchestrator,
};
pub use plans::{CountChannels, CountProtocol, CountSettings, Plan, PlanCommand};
