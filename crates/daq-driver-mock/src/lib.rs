//! Simulated hardware for pe-daq
//!
//! Provides a simulated Perkin-Elmer area detector for running the count
//! protocol without physical hardware. Simulated work uses
//! `tokio::time::sleep`, never `std::thread::sleep`, so tests can run on
//! paused time.
//!
//! # Modes
//!
//! - Instant: exposures complete immediately
//! - Realistic: `AcquireTime × NumImages` plus 133 ms readout per frame
//! - Chaos: realistic timing with up to 10% jitter
//!
//! Error injection ([`ErrorConfig`]) is independent of the mode.

pub mod common;
pub mod perkin_elmer;

pub use common::{ErrorConfig, ErrorScenario, ErrorSettings, MockMode, MockRng, TimingConfig};
pub use perkin_elmer::{
    channels, render_file_template, ExposureKind, PerkinElmerBuilder, PerkinElmerConfig,
    PerkinElmerDetector, SimulatedExposure, DEFAULT_FILE_TEMPLATE, DEFAULT_PREFIX, DRIVER_TYPE,
};
