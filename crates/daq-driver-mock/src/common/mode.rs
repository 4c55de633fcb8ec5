//! Operational modes for the simulated detector.
//!
//! - **Instant**: exposures complete without delay, for unit tests
//! - **Realistic**: exposures take `AcquireTime × NumImages` plus readout
//! - **Chaos**: realistic timing with jitter, for resilience testing
//!
//! Injected errors from [`super::ErrorConfig`] apply in every mode.

use serde::{Deserialize, Serialize};

/// Operational modes for mock devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockMode {
    /// Zero delays, deterministic
    #[default]
    Instant,
    /// Hardware-like timing
    Realistic,
    /// Hardware-like timing with random jitter
    Chaos,
}

impl std::fmt::Display for MockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockMode::Instant => write!(f, "instant"),
            MockMode::Realistic => write!(f, "realistic"),
            MockMode::Chaos => write!(f, "chaos"),
        }
    }
}

impl std::str::FromStr for MockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "instant" => Ok(MockMode::Instant),
            "realistic" => Ok(MockMode::Realistic),
            "chaos" => Ok(MockMode::Chaos),
            other => Err(format!(
                "Unknown mock mode '{}'. Must be one of: instant, realistic, chaos",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode() {
        assert_eq!(MockMode::default(), MockMode::Instant);
    }

    #[test]
    fn test_mode_serde_lowercase() {
        let mode: MockMode = serde_json::from_str("\"realistic\"").unwrap();
        assert_eq!(mode, MockMode::Realistic);
        assert_eq!(serde_json::to_string(&MockMode::Chaos).unwrap(), "\"chaos\"");
        assert_eq!(MockMode::Instant.to_string(), "instant");
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("Realistic".parse::<MockMode>().unwrap(), MockMode::Realistic);
        assert!("slow".parse::<MockMode>().is_err());
    }
}
