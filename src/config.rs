//! Configuration using Figment
//!
//! Configuration is layered, later sources winning:
//! 1. built-in defaults
//! 2. a TOML file (`config/pe_daq.toml` unless another path is given)
//! 3. environment variables prefixed with `PE_DAQ_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use pe_daq::config::PeDaqConfig;
//!
//! # fn main() -> anyhow::Result<()> {
//! // PE_DAQ_COUNT__NUM_REPETITIONS=3 overrides the file
//! let config = PeDaqConfig::load()?;
//! println!("Detector: {}", config.detector.prefix);
//! # Ok(())
//! # }
//! ```

use anyhow::{bail, ensure, Context, Result};
use chrono::Datelike;
use daq_driver_mock::PerkinElmerConfig;
use daq_experiment::{CountSettings, OrchestratorConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config/pe_daq.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "PE_DAQ_";

/// Longest accepted per-arm deadline (one week)
pub const MAX_ARM_TIMEOUT_SECS: f64 = 604_800.0;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeDaqConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Simulated detector
    pub detector: PerkinElmerConfig,
    /// Where files are written
    pub storage: StorageConfig,
    /// Proposal metadata, also used for the file path
    pub proposal: ProposalConfig,
    /// Count protocol parameters
    pub count: CountSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "pe-daq".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// File layout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Absolute resource root
    pub root: PathBuf,
    /// Directory below the proposal path, before year/cycle/proposal
    pub subdirectory: PathBuf,
    /// TIFF plugin file template
    pub naming_template: String,
    /// Per-arm deadline in seconds (unset waits indefinitely)
    pub arm_timeout_secs: Option<f64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/tmp"),
            subdirectory: PathBuf::from("perkin_elmer/detector"),
            naming_template: daq_driver_mock::DEFAULT_FILE_TEMPLATE.to_string(),
            arm_timeout_secs: None,
        }
    }
}

/// Proposal metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposalConfig {
    /// Calendar year; the current year when unset
    pub year: Option<i32>,
    /// Facility cycle, e.g. `C2`
    pub cycle: String,
    /// Proposal identifier; the directory is `XRD<proposal_id>`
    pub proposal_id: String,
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            year: None,
            cycle: "C1".to_string(),
            proposal_id: "commissioning".to_string(),
        }
    }
}

impl ProposalConfig {
    /// Configured year, or the current one
    pub fn year(&self) -> i32 {
        self.year.unwrap_or_else(|| chrono::Utc::now().year())
    }
}

impl PeDaqConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific TOML file and the environment, then validate.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: Self = Self::figment(path)
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Layered provider, exposed so callers can merge further overrides.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            bail!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            );
        }

        ensure!(
            self.storage.root.is_absolute(),
            "storage.root '{}' must be an absolute path",
            self.storage.root.display()
        );
        ensure!(
            self.storage.subdirectory.is_relative(),
            "storage.subdirectory '{}' must be relative",
            self.storage.subdirectory.display()
        );
        ensure!(
            !self.storage.naming_template.is_empty(),
            "storage.naming_template must not be empty"
        );
        if let Some(secs) = self.storage.arm_timeout_secs {
            ensure!(
                secs.is_finite() && secs > 0.0 && secs <= MAX_ARM_TIMEOUT_SECS,
                "storage.arm_timeout_secs must be within (0, {}], got {}",
                MAX_ARM_TIMEOUT_SECS,
                secs
            );
        }

        ensure!(!self.detector.name.is_empty(), "detector.name must not be empty");
        ensure!(!self.detector.prefix.is_empty(), "detector.prefix must not be empty");
        for (operation, rate) in &self.detector.errors.failure_rates {
            ensure!(
                (0.0..=1.0).contains(rate),
                "detector.errors.failure_rates.{} must be within 0..=1, got {}",
                operation,
                rate
            );
        }

        ensure!(!self.proposal.cycle.is_empty(), "proposal.cycle must not be empty");
        ensure!(
            !self.proposal.proposal_id.is_empty(),
            "proposal.proposal_id must not be empty"
        );

        self.count.validate().context("Invalid [count] section")?;
        Ok(())
    }

    /// Series directory below the root: `<subdirectory>/<year>/<cycle>/XRD<proposal>`
    pub fn relative_path(&self) -> PathBuf {
        self.storage
            .subdirectory
            .join(self.proposal.year().to_string())
            .join(&self.proposal.cycle)
            .join(format!("XRD{}", self.proposal.proposal_id))
    }

    /// Orchestrator settings derived from storage and proposal sections
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::new(self.storage.root.clone(), self.relative_path())
            .with_naming_template(self.storage.naming_template.clone())
            .with_metadata("proposal", self.proposal.proposal_id.clone())
            .with_metadata("cycle", self.proposal.cycle.clone())
            .with_metadata("year", self.proposal.year().to_string());
        if let Some(secs) = self.storage.arm_timeout_secs {
            // Unvalidated values that do not fit a Duration wait indefinitely
            let timeout = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
            config = config.with_arm_timeout(timeout);
        }
        config
    }
}
