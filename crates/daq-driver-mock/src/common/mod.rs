//! Common infrastructure for the simulated detector.
//!
//! - **mode**: Operational modes (Instant, Realistic, Chaos)
//! - **timing**: Readout and dark-frame timing
//! - **errors**: Error injection framework
//! - **rng**: Seeded random number generator

pub mod errors;
pub mod mode;
pub mod rng;
pub mod timing;

pub use errors::{ErrorConfig, ErrorScenario, ErrorSettings};
pub use mode::MockMode;
pub use rng::MockRng;
pub use timing::TimingConfig;
