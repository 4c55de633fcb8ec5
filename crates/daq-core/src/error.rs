//! Error types shared by every pe-daq crate.
//!
//! `DaqError` is the single error type that crosses component boundaries. It is
//! `Clone` because one acquisition failure is delivered, unchanged, to every
//! caller that coalesced onto the same in-flight job.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: unknown channel, read-only or status-owned channel,
//!   value that does not fit the channel type, conflicting acquisition request.
//!   Aborts the current repetition of a run.
//! - **`AcquisitionFailure`**: the simulated (or real) work of a job failed.
//!   Every waiter on that job receives the same value.
//! - **`Timeout`**: a caller stopped waiting. Local to that caller; the job it
//!   was waiting on keeps running and other waiters are unaffected.
//! - **`Lifecycle`**: stage while staged, datum while unstaged, and similar
//!   ordering mistakes. Aborts the current repetition.
//! - **`Driver`**: raw errors from a device driver, usually wrapped into
//!   `AcquisitionFailure` by the controller that ran the job.
//!
//! Coalescing a caller onto a busy controller is *not* an error. It is logged
//! and counted by [`crate::acquisition::AcquisitionController`].

use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Broad classification of a driver-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Device rejected its configuration
    Configuration,
    /// Link to the device was lost or garbled
    Communication,
    /// Device reported a fault
    Hardware,
    /// Device did not answer in time
    Timeout,
    /// Anything else
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Error raised by a device driver.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Driver identifier, e.g. `perkin_elmer`
    pub driver_type: String,
    /// Failure classification
    pub kind: DriverErrorKind,
    /// Human readable detail
    pub message: String,
}

impl DriverError {
    /// Build a driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

// =============================================================================
// DaqError
// =============================================================================

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition core.
#[derive(Error, Debug, Clone)]
pub enum DaqError {
    /// Invalid channel access or invalid request.
    ///
    /// **Recovery Strategy**: abort the current repetition; fix the caller.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An acquisition job failed. Shared by every coalesced waiter.
    #[error("Acquisition job {job_id} failed: {message}")]
    AcquisitionFailure {
        /// Identifier of the job that failed
        job_id: u64,
        /// Failure detail from the work that ran
        message: String,
    },

    /// The caller's wait exceeded its deadline.
    ///
    /// Only the waiter that timed out sees this; the job is not cancelled.
    #[error("Timed out after {after:?} waiting for {operation}")]
    Timeout {
        /// What was being waited on
        operation: String,
        /// The deadline that expired
        after: Duration,
    },

    /// Operation issued in the wrong lifecycle state.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Raw driver failure.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl DaqError {
    /// Short stable label, used in logs and stop documents.
    pub fn category(&self) -> &'static str {
        match self {
            DaqError::Configuration(_) => "configuration",
            DaqError::AcquisitionFailure { .. } => "acquisition_failure",
            DaqError::Timeout { .. } => "timeout",
            DaqError::Lifecycle(_) => "lifecycle",
            DaqError::Driver(_) => "driver",
        }
    }

    /// Build a timeout error.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        DaqError::Timeout {
            operation: operation.into(),
            after,
        }
    }
}
