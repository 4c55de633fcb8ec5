//! Timing configuration for realistic mode.
//!
//! Flat-panel detectors spend most of a job integrating; readout and
//! dark-frame (offset) acquisition add a fixed cost per frame.

use daq_core::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing configuration for realistic mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Readout time per frame in milliseconds
    pub frame_readout_ms: u64,
    /// Time per offset (dark) frame in milliseconds
    pub offset_frame_ms: u64,
    /// Communication delay per job in milliseconds
    pub communication_delay_ms: u64,
}

impl TimingConfig {
    /// Perkin-Elmer XRD1621-like timing (~7.5 fps readout)
    pub fn area_detector() -> Self {
        Self {
            frame_readout_ms: 133,
            offset_frame_ms: 133,
            communication_delay_ms: 2,
        }
    }

    /// Duration of a main acquisition: integration plus readout per frame.
    ///
    /// Fails with `Configuration` when the total does not fit a `Duration`.
    #[allow(clippy::cast_precision_loss)]
    pub fn exposure_duration(&self, acquire_time_s: f64, num_images: u64) -> AppResult<Duration> {
        let frames = num_images.max(1);
        let seconds = if acquire_time_s.is_nan() {
            acquire_time_s
        } else {
            acquire_time_s.max(0.0) * frames as f64
        };
        let integrate = Duration::try_from_secs_f64(seconds).map_err(|e| {
            DaqError::Configuration(format!(
                "Exposure of {} s x {} frames is out of range: {}",
                acquire_time_s, frames, e
            ))
        })?;
        self.per_frame(self.frame_readout_ms, frames)
            .and_then(|readout| integrate.checked_add(readout))
            .ok_or_else(|| {
                DaqError::Configuration(format!("Exposure of {} frames is out of range", frames))
            })
    }

    /// Duration of a dark-frame correction pass.
    pub fn offset_duration(&self, offset_frames: u64) -> AppResult<Duration> {
        let frames = offset_frames.max(1);
        self.per_frame(self.offset_frame_ms, frames).ok_or_else(|| {
            DaqError::Configuration(format!("Offset pass of {} frames is out of range", frames))
        })
    }

    fn per_frame(&self, frame_ms: u64, frames: u64) -> Option<Duration> {
        frame_ms
            .checked_mul(frames)?
            .checked_add(self.communication_delay_ms)
            .map(Duration::from_millis)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self::area_detector()
    }
}
