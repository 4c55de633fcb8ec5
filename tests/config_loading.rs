//! Layered configuration: defaults, TOML file, `PE_DAQ_` environment

use daq_driver_mock::{ErrorScenario, MockMode};
use pe_daq::config::{LogFormat, PeDaqConfig};
use serial_test::serial;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

/// Removes the variables it set, even when the test fails.
struct EnvGuard(Vec<&'static str>);

impl EnvGuard {
    fn set(vars: &[(&'static str, &str)]) -> Self {
        for (key, value) in vars {
            std::env::set_var(key, value);
        }
        Self(vars.iter().map(|(key, _)| *key).collect())
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for key in &self.0 {
            std::env::remove_var(key);
        }
    }
}

#[test]
#[serial]
fn test_missing_file_uses_defaults() {
    let config = PeDaqConfig::load_from("/nonexistent/pe_daq.toml").unwrap();
    assert_eq!(config, PeDaqConfig::default());
}

#[test]
#[serial]
fn test_file_values_loaded() {
    let file = write_config(
        r#"
        [application]
        log_level = "debug"
        log_format = "json"

        [detector]
        name = "pe2"
        mode = "realistic"

        [[detector.errors.scenarios]]
        kind = "fail_after_n"
        operation = "acquire"
        count = 2

        [storage]
        root = "/data"
        arm_timeout_secs = 30.0

        [proposal]
        year = 2021
        cycle = "C3"
        proposal_id = "12345"

        [count]
        exposure = 0.25
        num_repetitions = 3
        "#,
    );

    let config = PeDaqConfig::load_from(file.path()).unwrap();
    assert_eq!(config.application.log_format, LogFormat::Json);
    assert_eq!(config.detector.name, "pe2");
    assert_eq!(config.detector.mode, MockMode::Realistic);
    assert_eq!(
        config.detector.errors.scenarios,
        vec![ErrorScenario::FailAfterN {
            operation: "acquire".to_string(),
            count: 2
        }]
    );
    assert_eq!(config.count.exposure, 0.25);
    assert_eq!(config.count.num_repetitions, 3);
    // Unset keys keep their defaults
    assert_eq!(config.count.delay, 60.0);
    assert_eq!(config.detector.prefix, "XF:28ID1-ES{Det:PE1}");
    assert_eq!(
        config.relative_path(),
        PathBuf::from("perkin_elmer/detector/2021/C3/XRD12345")
    );
    assert_eq!(config.orchestrator_config().file_dir(), "/data/perkin_elmer/detector/2021/C3/XRD12345/");
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let file = write_config(
        r#"
        [count]
        num_repetitions = 3
        delay = 10.0
        "#,
    );
    let _env = EnvGuard::set(&[
        ("PE_DAQ_COUNT__NUM_REPETITIONS", "7"),
        ("PE_DAQ_DETECTOR__MODE", "chaos"),
        ("PE_DAQ_PROPOSAL__PROPOSAL_ID", "pass-300001"),
    ]);

    let config = PeDaqConfig::load_from(file.path()).unwrap();
    assert_eq!(config.count.num_repetitions, 7);
    assert_eq!(config.count.delay, 10.0);
    assert_eq!(config.detector.mode, MockMode::Chaos);
    assert_eq!(config.proposal.proposal_id, "pass-300001");
}

#[test]
#[serial]
fn test_invalid_values_rejected() {
    let cases = [
        "[application]\nlog_level = \"loud\"\n",
        "[storage]\nroot = \"relative/dir\"\n",
        "[count]\nexposure = 0.0\n",
        "[count]\nnum_images = 0\n",
        "[detector.errors.failure_rates]\nacquire = 1.5\n",
    ];
    for contents in cases {
        let file = write_config(contents);
        assert!(
            PeDaqConfig::load_from(file.path()).is_err(),
            "accepted invalid config: {}",
            contents
        );
    }
}

#[test]
#[serial]
fn test_invalid_env_value_rejected() {
    let _env = EnvGuard::set(&[("PE_DAQ_DETECTOR__MODE", "slow")]);
    let err = PeDaqConfig::load_from("/nonexistent/pe_daq.toml").unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to load configuration"));
}

#[test]
#[serial]
fn test_shipped_config_is_valid() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/pe_daq.toml");
    let config = PeDaqConfig::load_from(path).unwrap();
    assert_eq!(config.detector.mode, MockMode::Realistic);
    assert_eq!(config.proposal.proposal_id, "67890");
}
