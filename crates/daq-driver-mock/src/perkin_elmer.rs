//! Simulated Perkin-Elmer flat-panel detector with a TIFF file plugin.
//!
//! The channel table mirrors the areaDetector IOC (`cam1:` camera records,
//! `TIFF1:` file plugin records). Two single-flight controllers own the slow
//! operations:
//!
//! - `cam1:Acquire`: main exposure, `AcquireTime × NumImages` plus readout
//! - `cam1:PEAcquireOffset`: dark-frame correction, `PENumOffsetFrames` frames
//!
//! Writing `1` to `TIFF1:WriteFile` renders `FullFileName_RBV` from
//! `FilePath`/`FileName`/`FileNumber`/`FileTemplate`, bumps `FileNumber` when
//! `AutoIncrement` is on, and drops `WriteFile` back to 0.
//!
//! # Example
//!
//! ```rust,ignore
//! let det = PerkinElmerDetector::builder()
//!     .mode(MockMode::Realistic)
//!     .error_config(ErrorConfig::fail_after("acquire", 1))
//!     .build()?;
//! det.set(channels::ACQUIRE_TIME, 0.5)?;
//! det.acquire_controller()
//!     .arm_and_wait(AcquisitionRequest::new(channels::ACQUIRE, 1))
//!     .await?;
//! ```

use crate::common::{ErrorConfig, ErrorSettings, MockMode, MockRng, TimingConfig};
use async_trait::async_trait;
use daq_core::acquisition::{AcquisitionController, AcquisitionWork, ControllerConfig};
use daq_core::capabilities::{Acquirable, AssetRegistry, Configurable, StageRequest, Stageable};
use daq_core::channel::{ChannelSpec, ChannelStore, ChannelValue};
use daq_core::error::{AppResult, DaqError};
use daq_core::experiment::{now_secs, DatumDoc, Document, ResourceDoc};
use daq_storage::ResourceTracker;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Driver identifier used in errors and logs.
pub const DRIVER_TYPE: &str = "perkin_elmer";

/// Prefix-relative channel names, as published by the IOC.
#[allow(missing_docs)]
pub mod channels {
    pub const ACQUIRE: &str = "cam1:Acquire";
    pub const ACQUIRE_TIME: &str = "cam1:AcquireTime";
    pub const ACQUIRE_PERIOD: &str = "cam1:AcquirePeriod";
    pub const IMAGE_MODE: &str = "cam1:ImageMode";
    pub const NUM_IMAGES: &str = "cam1:NumImages";
    pub const NUM_EXPOSURES: &str = "cam1:NumExposures";
    pub const TRIGGER_MODE: &str = "cam1:TriggerMode";
    pub const ACQUIRE_OFFSET: &str = "cam1:PEAcquireOffset";
    pub const NUM_OFFSET_FRAMES: &str = "cam1:PENumOffsetFrames";
    pub const ARRAY_CALLBACKS: &str = "cam1:ArrayCallbacks";
    pub const DETECTOR_STATE: &str = "cam1:DetectorState_RBV";
    pub const MANUFACTURER: &str = "cam1:Manufacturer_RBV";
    pub const MODEL: &str = "cam1:Model_RBV";
    pub const ARRAY_COUNTER: &str = "cam1:ArrayCounter_RBV";

    pub const FILE_NAME: &str = "TIFF1:FileName";
    pub const FILE_PATH: &str = "TIFF1:FilePath";
    pub const FILE_NUMBER: &str = "TIFF1:FileNumber";
    pub const FILE_TEMPLATE: &str = "TIFF1:FileTemplate";
    pub const FILE_WRITE_MODE: &str = "TIFF1:FileWriteMode";
    pub const WRITE_FILE: &str = "TIFF1:WriteFile";
    pub const AUTO_INCREMENT: &str = "TIFF1:AutoIncrement";
    pub const ENABLE_CALLBACKS: &str = "TIFF1:EnableCallbacks";
    pub const BLOCKING_CALLBACKS: &str = "TIFF1:BlockingCallbacks";
    pub const PLUGIN_TYPE: &str = "TIFF1:PluginType_RBV";
    pub const FULL_FILE_NAME: &str = "TIFF1:FullFileName_RBV";
}

/// Default IOC prefix
pub const DEFAULT_PREFIX: &str = "XF:28ID1-ES{Det:PE1}";

/// Default file template of the TIFF plugin
pub const DEFAULT_FILE_TEMPLATE: &str = "%s%s_%6.6d.tiff";

const IMAGE_MODES: &[&str] = &["Single", "Multiple", "Continuous", "Average"];
const TRIGGER_MODES: &[&str] = &["Internal", "External", "Free Running", "Soft Trigger"];
const DETECTOR_STATES: &[&str] = &[
    "Idle", "Acquire", "Readout", "Correct", "Saving", "Aborting", "Error", "Waiting",
];
const WRITE_MODES: &[&str] = &["Single", "Capture", "Stream"];
const BUSY: &[&str] = &["Done", "Acquire"];
const NO_YES: &[&str] = &["No", "Yes"];
const DISABLE_ENABLE: &[&str] = &["Disable", "Enable"];

// =============================================================================
// File naming
// =============================================================================

/// Render an areaDetector printf-style file template.
///
/// Supports `%s` (path, then name), `%d` with optional `0` flag, width and
/// precision (`%6.6d`, `%04d`), and `%%`.
pub fn render_file_template(template: &str, path: &str, name: &str, number: i64) -> AppResult<String> {
    let mut out = String::with_capacity(template.len() + path.len() + name.len() + 8);
    let mut strings = [path, name].into_iter();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut zero = false;
        let mut width = String::new();
        let mut precision: Option<String> = None;
        if chars.peek() == Some(&'0') {
            zero = true;
            chars.next();
        }
        while let Some(d) = chars.next_if(char::is_ascii_digit) {
            width.push(d);
        }
        if chars.next_if_eq(&'.').is_some() {
            let mut p = String::new();
            while let Some(d) = chars.next_if(char::is_ascii_digit) {
                p.push(d);
            }
            precision = Some(p);
        }

        match chars.next() {
            Some('%') => out.push('%'),
            Some('s') => {
                let value = strings.next().ok_or_else(|| {
                    DaqError::Configuration(format!("Too many %s in file template '{}'", template))
                })?;
                out.push_str(value);
            }
            Some('d') => {
                let width: usize = width.parse().unwrap_or(0);
                let precision: usize = precision.and_then(|p| p.parse().ok()).unwrap_or(0);
                let digits = format!("{:0>precision$}", number.unsigned_abs(), precision = precision);
                let signed = if number < 0 { format!("-{}", digits) } else { digits };
                if zero {
                    out.push_str(&format!("{:0>width$}", signed, width = width));
                } else {
                    out.push_str(&format!("{:>width$}", signed, width = width));
                }
            }
            other => {
                return Err(DaqError::Configuration(format!(
                    "Unsupported conversion {:?} in file template '{}'",
                    other, template
                )))
            }
        }
    }
    Ok(out)
}

fn write_file_hook(errors: ErrorConfig) -> impl Fn(&ChannelStore, &ChannelValue) -> AppResult<()> + Send + Sync + 'static {
    move |store, value| {
        if value.as_i64() != Some(1) {
            return Ok(());
        }
        let result = errors
            .check_operation(DRIVER_TYPE, "write_file")
            .map_err(DaqError::from)
            .and_then(|()| {
                let path = store.get(channels::FILE_PATH)?;
                let name = store.get(channels::FILE_NAME)?;
                let template = store.get(channels::FILE_TEMPLATE)?;
                let number = store.get_i64(channels::FILE_NUMBER)?;
                let full = render_file_template(
                    template.as_str().unwrap_or(DEFAULT_FILE_TEMPLATE),
                    path.as_str().unwrap_or_default(),
                    name.as_str().unwrap_or_default(),
                    number,
                )?;
                store.commit(channels::FULL_FILE_NAME, full.as_str())?;
                if store.enum_label(channels::AUTO_INCREMENT)?.as_deref() == Some("Yes") {
                    store.commit(channels::FILE_NUMBER, number + 1)?;
                }
                debug!(file = %full, "Simulated TIFF written");
                Ok(())
            });
        // The busy record drops back whether or not the write succeeded.
        store.commit(channels::WRITE_FILE, 0)?;
        result
    }
}

fn channel_table(errors: &ErrorConfig) -> Vec<ChannelSpec> {
    use channels::*;
    vec![
        // cam1
        ChannelSpec::enumeration(ACQUIRE, BUSY, 0)
            .status()
            .with_readback()
            .describe("Start an exposure"),
        ChannelSpec::float(ACQUIRE_TIME, 0.1)
            .positive()
            .with_readback()
            .units("s")
            .describe("Exposure per frame"),
        ChannelSpec::float(ACQUIRE_PERIOD, 0.1).with_readback().units("s"),
        ChannelSpec::enumeration(IMAGE_MODE, IMAGE_MODES, 0).with_readback(),
        ChannelSpec::int(NUM_IMAGES, 1).positive().with_readback(),
        ChannelSpec::int(NUM_EXPOSURES, 1).with_readback(),
        ChannelSpec::enumeration(TRIGGER_MODE, TRIGGER_MODES, 0).with_readback(),
        ChannelSpec::enumeration(ACQUIRE_OFFSET, BUSY, 0)
            .status()
            .with_readback()
            .describe("Acquire dark frames for offset correction"),
        ChannelSpec::int(NUM_OFFSET_FRAMES, 1).with_readback(),
        ChannelSpec::enumeration(ARRAY_CALLBACKS, DISABLE_ENABLE, 1).with_readback(),
        ChannelSpec::enumeration(DETECTOR_STATE, DETECTOR_STATES, 0).read_only(),
        ChannelSpec::string(MANUFACTURER, "Perkin Elmer").read_only(),
        ChannelSpec::string(MODEL, "XRD1621 (simulated)").read_only(),
        ChannelSpec::int(ARRAY_COUNTER, 0).read_only(),
        // TIFF1
        ChannelSpec::string(FILE_NAME, "").with_readback(),
        ChannelSpec::string(FILE_PATH, "").with_readback(),
        ChannelSpec::int(FILE_NUMBER, 0).with_readback(),
        ChannelSpec::string(FILE_TEMPLATE, DEFAULT_FILE_TEMPLATE).with_readback(),
        ChannelSpec::enumeration(FILE_WRITE_MODE, WRITE_MODES, 0).with_readback(),
        ChannelSpec::int(WRITE_FILE, 0)
            .with_readback()
            .describe("Write the last frame to FullFileName")
            .on_write(write_file_hook(errors.clone())),
        ChannelSpec::enumeration(AUTO_INCREMENT, NO_YES, 1).with_readback(),
        ChannelSpec::enumeration(ENABLE_CALLBACKS, DISABLE_ENABLE, 0).with_readback(),
        ChannelSpec::enumeration(BLOCKING_CALLBACKS, NO_YES, 0).with_readback(),
        ChannelSpec::string(PLUGIN_TYPE, "NDFileTIFF").read_only(),
        ChannelSpec::string(FULL_FILE_NAME, "").read_only(),
    ]
}

// =============================================================================
// Simulated work
// =============================================================================

/// Which slow operation a [`SimulatedExposure`] stands in for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureKind {
    /// `cam1:Acquire`
    Main,
    /// `cam1:PEAcquireOffset`
    Offset,
}

impl ExposureKind {
    /// Operation name checked against the error injection table
    pub fn operation(self) -> &'static str {
        match self {
            ExposureKind::Main => "acquire",
            ExposureKind::Offset => "acquire_offset",
        }
    }
}

/// Simulated exposure or dark-frame pass.
#[derive(Debug)]
pub struct SimulatedExposure {
    kind: ExposureKind,
    mode: MockMode,
    timing: TimingConfig,
    errors: ErrorConfig,
    rng: Arc<MockRng>,
}

impl SimulatedExposure {
    /// Work for one controller; each instance seeds its own jitter RNG
    pub fn new(kind: ExposureKind, mode: MockMode, timing: TimingConfig, errors: ErrorConfig) -> Self {
        Self {
            kind,
            mode,
            timing,
            errors,
            rng: Arc::new(MockRng::default()),
        }
    }

    fn duration(&self, store: &ChannelStore) -> AppResult<Duration> {
        match self.kind {
            ExposureKind::Main => {
                let exposure = store.get_f64(channels::ACQUIRE_TIME)?;
                let images = u64::try_from(store.get_i64(channels::NUM_IMAGES)?).unwrap_or(0);
                self.timing.exposure_duration(exposure, images)
            }
            ExposureKind::Offset => {
                let frames = u64::try_from(store.get_i64(channels::NUM_OFFSET_FRAMES)?).unwrap_or(0);
                self.timing.offset_duration(frames)
            }
        }
    }
}

#[async_trait]
impl AcquisitionWork for SimulatedExposure {
    async fn run(&self, job_id: u64, store: &ChannelStore) -> AppResult<()> {
        self.errors.check_operation(DRIVER_TYPE, self.kind.operation())?;

        match self.mode {
            MockMode::Instant => tokio::task::yield_now().await,
            MockMode::Realistic => tokio::time::sleep(self.duration(store)?).await,
            MockMode::Chaos => {
                let base = self.duration(store)?;
                let max_jitter = u64::try_from(base.as_millis() / 10).unwrap_or(u64::MAX);
                let jitter = Duration::from_millis(self.rng.gen_range(0..=max_jitter));
                tokio::time::sleep(base.saturating_add(jitter)).await;
            }
        }

        if self.kind == ExposureKind::Main {
            let images = store.get_i64(channels::NUM_IMAGES)?.max(1);
            let counter = store.get_i64(channels::ARRAY_COUNTER)?;
            store.commit(channels::ARRAY_COUNTER, counter + images)?;
        }
        debug!(job_id, operation = self.kind.operation(), mode = %self.mode, "Simulated exposure finished");
        Ok(())
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Loadable detector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerkinElmerConfig {
    /// Device name; events use `<name>_image`
    pub name: String,
    /// IOC prefix
    pub prefix: String,
    /// Simulation mode
    pub mode: MockMode,
    /// Realistic-mode timing
    pub timing: TimingConfig,
    /// Error injection
    pub errors: ErrorSettings,
}

impl Default for PerkinElmerConfig {
    fn default() -> Self {
        Self {
            name: "pe1".to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            mode: MockMode::default(),
            timing: TimingConfig::default(),
            errors: ErrorSettings::default(),
        }
    }
}

// =============================================================================
// PerkinElmerBuilder
// =============================================================================

/// Builder for [`PerkinElmerDetector`]
pub struct PerkinElmerBuilder {
    name: String,
    prefix: String,
    mode: MockMode,
    error_config: ErrorConfig,
    timing_config: TimingConfig,
}

impl PerkinElmerBuilder {
    /// Builder with the `pe1` name, default prefix and instant mode
    pub fn new() -> Self {
        Self {
            name: "pe1".to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            mode: MockMode::Instant,
            error_config: ErrorConfig::none(),
            timing_config: TimingConfig::area_detector(),
        }
    }

    /// Device name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// IOC prefix prepended to every channel
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Simulation mode
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Error injection
    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    /// Realistic-mode timing
    pub fn timing_config(mut self, config: TimingConfig) -> Self {
        self.timing_config = config;
        self
    }

    /// Build the channel store, controllers and tracker
    pub fn build(self) -> AppResult<PerkinElmerDetector> {
        PerkinElmerDetector::from_builder(self)
    }
}

impl Default for PerkinElmerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// PerkinElmerDetector
// =============================================================================

/// Simulated detector: channel store, two controllers and a resource tracker.
pub struct PerkinElmerDetector {
    name: String,
    mode: MockMode,
    store: ChannelStore,
    acquire: AcquisitionController,
    offset: AcquisitionController,
    tracker: ResourceTracker,
}

impl std::fmt::Debug for PerkinElmerDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerkinElmerDetector")
            .field("name", &self.name)
            .field("prefix", &self.store.prefix())
            .field("mode", &self.mode)
            .field("staged", &self.tracker.is_staged())
            .finish()
    }
}

impl PerkinElmerDetector {
    /// Start a builder
    pub fn builder() -> PerkinElmerBuilder {
        PerkinElmerBuilder::new()
    }

    /// Build from loaded configuration.
    pub fn from_config(config: &PerkinElmerConfig) -> AppResult<Self> {
        Self::builder()
            .name(config.name.clone())
            .prefix(config.prefix.clone())
            .mode(config.mode)
            .timing_config(config.timing)
            .error_config(ErrorConfig::from_settings(&config.errors))
            .build()
    }

    fn from_builder(builder: PerkinElmerBuilder) -> AppResult<Self> {
        let store = ChannelStore::from_table(&builder.prefix, channel_table(&builder.error_config))?;

        let work = |kind| -> Arc<dyn AcquisitionWork> {
            Arc::new(SimulatedExposure::new(
                kind,
                builder.mode,
                builder.timing_config,
                builder.error_config.clone(),
            ))
        };
        let acquire = AcquisitionController::new(
            format!("{}.acquire", builder.name),
            store.clone(),
            ControllerConfig::new(channels::ACQUIRE, 1, 0).with_state_channel(channels::DETECTOR_STATE),
            work(ExposureKind::Main),
        )?;
        let offset = AcquisitionController::new(
            format!("{}.acquire_offset", builder.name),
            store.clone(),
            ControllerConfig::new(channels::ACQUIRE_OFFSET, 1, 0)
                .with_state_channel(channels::DETECTOR_STATE),
            work(ExposureKind::Offset),
        )?;

        info!(
            name = %builder.name,
            prefix = %builder.prefix,
            mode = %builder.mode,
            error_injection = builder.error_config.is_enabled(),
            "Simulated Perkin-Elmer detector ready"
        );

        Ok(Self {
            name: builder.name,
            mode: builder.mode,
            store,
            acquire,
            offset,
            tracker: ResourceTracker::new(),
        })
    }

    /// Simulation mode the detector was built with
    pub fn mode(&self) -> MockMode {
        self.mode
    }

    /// Controller for `cam1:Acquire`
    pub fn acquire_controller(&self) -> &AcquisitionController {
        &self.acquire
    }

    /// Controller for `cam1:PEAcquireOffset`
    pub fn offset_controller(&self) -> &AcquisitionController {
        &self.offset
    }

    /// File series bookkeeping
    pub fn resource_tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    /// Event field name for the image datum
    pub fn image_key(&self) -> String {
        format!("{}_image", self.name)
    }

    fn configure_plugin(&self, naming_template: &str) -> AppResult<()> {
        self.store.set(channels::FILE_TEMPLATE, naming_template)?;
        self.store.set(channels::AUTO_INCREMENT, "Yes")?;
        self.store.set(channels::ENABLE_CALLBACKS, "Enable")?;
        self.store.set(channels::ARRAY_CALLBACKS, "Enable")?;
        Ok(())
    }
}

impl Configurable for PerkinElmerDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> &ChannelStore {
        &self.store
    }
}

#[async_trait]
impl Stageable for PerkinElmerDetector {
    async fn stage(&self, request: &StageRequest) -> AppResult<ResourceDoc> {
        if self.tracker.is_staged() {
            return Err(DaqError::Lifecycle(format!("Detector '{}' is already staged", self.name)));
        }
        // Paths are checked before the plugin is touched
        let descriptor = self.tracker.stage(request)?;
        if let Err(e) = self.configure_plugin(&request.naming_template) {
            self.tracker.unstage();
            return Err(e);
        }
        Ok(descriptor.to_document(request.run_start.as_deref()))
    }

    async fn unstage(&self) -> AppResult<()> {
        self.tracker.unstage();
        self.store.set(channels::ENABLE_CALLBACKS, "Disable")?;
        Ok(())
    }

    fn is_staged(&self) -> bool {
        self.tracker.is_staged()
    }
}

impl Acquirable for PerkinElmerDetector {
    fn controller(&self, status_channel: &str) -> AppResult<AcquisitionController> {
        let full = self.store.full_name(status_channel)?;
        [&self.acquire, &self.offset]
            .into_iter()
            .find(|c| c.status_channel() == full)
            .cloned()
            .ok_or_else(|| {
                DaqError::Configuration(format!("'{}' is not owned by an acquisition controller", full))
            })
    }
}

impl AssetRegistry for PerkinElmerDetector {
    fn generate_datum(
        &self,
        key: &str,
        params: serde_json::Map<String, serde_json::Value>,
    ) -> AppResult<DatumDoc> {
        self.tracker
            .generate_datum(key, now_secs(), params)
            .map(|datum| datum.to_document())
    }

    fn collect_asset_docs(&self) -> Vec<Document> {
        self.tracker.collect_asset_docs()
    }

    fn artifact_path(&self, filename: &str) -> AppResult<PathBuf> {
        self.tracker.artifact_path(filename)
    }
}
