//! CLI Entry Point for pe-daq
//!
//! Runs the dark-corrected count against the simulated detector and prints
//! the run's documents to stdout as JSON lines. Logs go to stderr.
//!
//! # Usage
//!
//! Run a count with file configuration:
//! ```bash
//! pe-daq --config config/pe_daq.toml count
//! ```
//!
//! Override a few parameters:
//! ```bash
//! pe-daq count --repetitions 3 --exposure 0.5 --delay 0 --mode realistic
//! ```
//!
//! Inspect the simulated IOC:
//! ```bash
//! pe-daq channels
//! pe-daq config
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use daq_driver_mock::MockMode;
use pe_daq::config::{LogFormat, PeDaqConfig, DEFAULT_CONFIG_PATH};
use pe_daq::{build_orchestrator, logging, Configurable, CountProtocol, PerkinElmerDetector, RunOutcome};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pe-daq")]
#[command(about = "Simulated Perkin-Elmer acquisition with file provenance tracking", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override the configured log format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dark-corrected count
    Count {
        #[arg(long)]
        repetitions: Option<u32>,

        /// Exposure per frame in seconds
        #[arg(long)]
        exposure: Option<f64>,

        /// Frames averaged per acquisition
        #[arg(long)]
        images: Option<u32>,

        /// Dark frames per repetition (0 skips dark correction)
        #[arg(long)]
        dark_images: Option<u32>,

        /// Seconds to wait after each repetition
        #[arg(long)]
        delay: Option<f64>,

        /// File name stem
        #[arg(long)]
        file_name: Option<String>,

        /// Simulation mode (instant, realistic, chaos)
        #[arg(long)]
        mode: Option<MockMode>,

        /// Per-arm timeout in seconds
        #[arg(long)]
        timeout: Option<f64>,
    },

    /// List the detector's channels and current values
    Channels,

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = PeDaqConfig::load_from(&cli.config)?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.application.log_format = format;
    }

    match cli.command {
        Commands::Count {
            repetitions,
            exposure,
            images,
            dark_images,
            delay,
            file_name,
            mode,
            timeout,
        } => {
            let count = &mut config.count;
            count.num_repetitions = repetitions.unwrap_or(count.num_repetitions);
            count.exposure = exposure.unwrap_or(count.exposure);
            count.num_images = images.unwrap_or(count.num_images);
            count.num_dark_images = dark_images.unwrap_or(count.num_dark_images);
            count.delay = delay.unwrap_or(count.delay);
            if let Some(name) = file_name {
                count.file_name_base = name;
            }
            if let Some(mode) = mode {
                config.detector.mode = mode;
            }
            if timeout.is_some() {
                config.storage.arm_timeout_secs = timeout;
            }
            config.validate().context("Invalid command-line override")?;

            logging::init_from_config(&config)?;
            run_count(&config).await
        }
        Commands::Channels => {
            logging::init_from_config(&config)?;
            print_channels(&config)
        }
        Commands::Config => {
            let text = toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{}", text);
            Ok(())
        }
    }
}

async fn run_count(config: &PeDaqConfig) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let mut plan = CountProtocol::new(config.count.clone())?;

    info!(
        detector = %config.detector.name,
        mode = %config.detector.mode,
        path = %config.orchestrator_config().file_dir(),
        "Starting count"
    );

    // Print documents as they arrive
    let mut docs = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        let stdout = std::io::stdout();
        loop {
            match docs.recv().await {
                Ok(doc) => {
                    let line = serde_json::to_string(&doc)?;
                    writeln!(stdout.lock(), "{}", line)?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Document printer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
        anyhow::Ok(())
    });

    let summary = orchestrator.run(&mut plan).await?;
    drop(orchestrator);
    printer.await.context("Document printer panicked")??;

    match summary.outcome {
        RunOutcome::Success => {
            info!(
                run_uid = %summary.run_uid,
                repetitions = summary.completed_repetitions,
                datums = summary.datums.len(),
                "Count finished"
            );
            Ok(())
        }
        RunOutcome::Failed { repetition, error } => bail!(
            "Count {} failed in repetition {} after {} completed: {}",
            summary.run_uid,
            repetition,
            summary.completed_repetitions,
            error
        ),
    }
}

fn print_channels(config: &PeDaqConfig) -> Result<()> {
    let detector = PerkinElmerDetector::from_config(&config.detector)?;
    let store = detector.channels();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for name in store.names() {
        let value = store.get(&name)?;
        let meta = store.metadata(&name)?;
        let access = if meta.read_only { "ro" } else { "rw" };
        let units = meta.units.unwrap_or_default();
        writeln!(out, "{:<40} {:<6} {:>3} {} {}", name, meta.dtype, access, value, units)?;
    }
    Ok(())
}
