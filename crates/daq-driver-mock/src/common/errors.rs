//! Error injection for the simulated detector.
//!
//! Scenarios are checked by name at the start of each simulated operation
//! (`acquire`, `acquire_offset`, `write_file`). A triggered scenario turns into
//! a [`DriverError`], which the acquisition controller reports to every waiter
//! as `AcquisitionFailure`.
//!
//! Scenarios deserialize from configuration:
//!
//! ```toml
//! [[detector.errors.scenarios]]
//! kind = "fail_after_n"
//! operation = "acquire"
//! count = 1
//! ```

use super::rng::MockRng;
use daq_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Operation name matching every operation in a failure-rate table.
pub const ANY_OPERATION: &str = "*";

/// A scripted failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorScenario {
    /// Fail every call of `operation` after `count` successful ones
    FailAfterN { operation: String, count: u32 },
    /// Fail `operation` with a timeout every time
    Timeout { operation: String },
    /// Lose the link on the first call; every later call fails too
    CommunicationLoss,
    /// Latch a hardware fault on the first call
    HardwareFault { code: u32 },
}

/// Serializable form of an [`ErrorConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorSettings {
    /// Scripted scenarios, checked in order
    pub scenarios: Vec<ErrorScenario>,
    /// Per-operation random failure probability (`"*"` for all)
    pub failure_rates: HashMap<String, f64>,
    /// RNG seed for reproducible random failures
    pub seed: Option<u64>,
}

#[derive(Default, Debug)]
struct ErrorState {
    operation_counts: HashMap<String, u32>,
    communication_lost: bool,
    hardware_fault_code: u32,
}

/// Error injection configuration for mock devices
///
/// Cheap to clone; clones share counters and latched faults.
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    failure_rates: Arc<HashMap<String, f64>>,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<MockRng>,
    state: Arc<Mutex<ErrorState>>,
}

impl ErrorConfig {
    fn build(
        scenarios: Vec<ErrorScenario>,
        failure_rates: HashMap<String, f64>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(failure_rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// No injected errors
    pub fn none() -> Self {
        Self::build(Vec::new(), HashMap::new(), None)
    }

    /// A single scenario
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scenarios, checked in order
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(scenarios, HashMap::new(), None)
    }

    /// Shorthand for `FailAfterN`
    pub fn fail_after(operation: &str, count: u32) -> Self {
        Self::scenario(ErrorScenario::FailAfterN {
            operation: operation.to_string(),
            count,
        })
    }

    /// Build from loaded configuration.
    pub fn from_settings(settings: &ErrorSettings) -> Self {
        Self::build(
            settings.scenarios.clone(),
            settings.failure_rates.clone(),
            settings.seed,
        )
    }

    /// Whether any failure can be injected
    pub fn is_enabled(&self) -> bool {
        !self.scenarios.is_empty() || self.failure_rates.values().any(|r| *r > 0.0)
    }

    /// Check if an operation should fail and return appropriate error
    pub fn check_operation(&self, driver_type: &str, operation: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Communication,
                "Communication lost",
            ));
        }
        if state.hardware_fault_code != 0 {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("Hardware fault: {}", state.hardware_fault_code),
            ));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if op == operation => {
                    let current = state.operation_counts.entry(op.clone()).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(DriverError::new(
                            driver_type,
                            DriverErrorKind::Hardware,
                            format!("Injected failure on '{}' after {} operations", op, count),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if op == operation => {
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Timeout,
                        format!("Operation '{}' timed out", operation),
                    ));
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Communication,
                        "Communication lost",
                    ));
                }
                ErrorScenario::HardwareFault { code } => {
                    state.hardware_fault_code = *code;
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Hardware,
                        format!("Hardware fault: {}", code),
                    ));
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get(ANY_OPERATION))
            .copied()
            .unwrap_or(0.0);
        if self.rng.should_fail(rate) {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("Random failure on operation '{}'", operation),
            ));
        }

        Ok(())
    }

    /// Clear counters and latched faults
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_errors() {
        let config = ErrorConfig::none();
        assert!(!config.is_enabled());
        for _ in 0..100 {
            assert!(config.check_operation("perkin_elmer", "acquire").is_ok());
        }
    }

    #[test]
    fn test_fail_after_n_only_counts_its_operation() {
        let config = ErrorConfig::fail_after("acquire", 1);

        assert!(config.check_operation("perkin_elmer", "acquire").is_ok());
        assert!(config.check_operation("perkin_elmer", "acquire_offset").is_ok());
        let err = config.check_operation("perkin_elmer", "acquire").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Hardware);
        assert!(err.message.contains("after 1 operations"));
        assert!(config.check_operation("perkin_elmer", "acquire_offset").is_ok());
    }

    #[test]
    fn test_timeout_scenario() {
        let config = ErrorConfig::scenario(ErrorScenario::Timeout {
            operation: "acquire_offset".to_string(),
        });
        let err = config
            .check_operation("perkin_elmer", "acquire_offset")
            .unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Timeout);
        assert!(config.check_operation("perkin_elmer", "acquire").is_ok());
    }

    #[test]
    fn test_latched_faults() {
        let config = ErrorConfig::scenario(ErrorScenario::HardwareFault { code: 0x42 });
        let err = config.check_operation("perkin_elmer", "acquire").unwrap_err();
        assert!(err.message.contains("66"));
        assert!(config.check_operation("perkin_elmer", "write_file").is_err());

        config.reset();
        // Scenario re-latches on the next call
        assert!(config.check_operation("perkin_elmer", "acquire").is_err());

        let config = ErrorConfig::scenario(ErrorScenario::CommunicationLoss);
        let err = config.check_operation("perkin_elmer", "acquire").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Communication);
    }

    #[test]
    fn test_seeded_random_failures() {
        let settings = ErrorSettings {
            failure_rates: [(ANY_OPERATION.to_string(), 0.5)].into_iter().collect(),
            seed: Some(42),
            ..ErrorSettings::default()
        };
        let config = ErrorConfig::from_settings(&settings);
        let failures = (0..1000)
            .filter(|_| config.check_operation("perkin_elmer", "acquire").is_err())
            .count();
        assert!(failures > 400 && failures < 600, "Got {} failures", failures);
    }

    #[test]
    fn test_settings_round_trip_from_toml() {
        let settings: ErrorSettings = toml::from_str(
            r#"
            seed = 7
            [failure_rates]
            write_file = 1.0

            [[scenarios]]
            kind = "fail_after_n"
            operation = "acquire"
            count = 2
            "#,
        )
        .unwrap();
        assert_eq!(settings.scenarios.len(), 1);

        let config = ErrorConfig::from_settings(&settings);
        assert!(config.is_enabled());
        assert!(config.check_operation("perkin_elmer", "write_file").is_err());
        assert!(config.check_operation("perkin_elmer", "acquire").is_ok());
    }
}
