//! Device capabilities
//!
//! Small capability traits a detector implements instead of one monolithic
//! device trait. The orchestrator is generic over [`AreaDetector`], which is
//! just the combination of the four:
//!
//! - [`Configurable`]: named channel access (`set`/`get`/snapshot)
//! - [`Stageable`]: open and close a file series
//! - [`Acquirable`]: hand out the single-flight controllers for slow operations
//! - [`AssetRegistry`]: per-acquisition datum references and queued documents
//!
//! All traits are `Send + Sync` and take `&self`; implementors keep their state
//! behind interior mutability so a detector can be shared as `Arc<D>`.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn snap<D: AreaDetector>(det: &D) -> AppResult<DatumDoc> {
//!     det.set("cam1:AcquireTime", 0.5)?;
//!     let acquire = det.controller("cam1:Acquire")?;
//!     acquire
//!         .arm_and_wait(AcquisitionRequest::new("cam1:Acquire", 1))
//!         .await?;
//!     det.generate_datum("pe1_image", serde_json::Map::new())
//! }
//! ```

use crate::acquisition::AcquisitionController;
use crate::channel::{ChannelStore, ChannelValue};
use crate::error::AppResult;
use crate::experiment::{DatumDoc, Document, ResourceDoc};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Where and how a staged file series is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRequest {
    /// Absolute root directory
    pub root: PathBuf,
    /// Series directory relative to `root`
    pub relative_path: PathBuf,
    /// printf-style file template, e.g. `%s%s_%6.6d.tiff`
    pub naming_template: String,
    /// Run that owns the series
    pub run_start: Option<String>,
}

impl StageRequest {
    /// Request for a series under `root / relative_path`
    pub fn new(
        root: impl Into<PathBuf>,
        relative_path: impl Into<PathBuf>,
        naming_template: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            relative_path: relative_path.into(),
            naming_template: naming_template.into(),
            run_start: None,
        }
    }

    /// Link the resource to a run
    pub fn with_run_start(mut self, run_uid: impl Into<String>) -> Self {
        self.run_start = Some(run_uid.into());
        self
    }
}

// =============================================================================
// Capability: Configurable
// =============================================================================

/// Named channel access.
///
/// # Contract
/// - `set` is the external write path: read-only and status channels reject it.
/// - `configuration` is what a descriptor document records for the device.
pub trait Configurable: Send + Sync {
    /// Device name, used as the event field prefix
    fn name(&self) -> &str;

    /// Backing channel store
    fn channels(&self) -> &ChannelStore;

    /// External write
    fn set(&self, channel: &str, value: impl Into<ChannelValue>) -> AppResult<()>
    where
        Self: Sized,
    {
        self.channels().set(channel, value)
    }

    /// Current value
    fn get(&self, channel: &str) -> AppResult<ChannelValue> {
        self.channels().get(channel)
    }

    /// Snapshot of every channel
    fn configuration(&self) -> BTreeMap<String, serde_json::Value> {
        self.channels().snapshot()
    }
}

// =============================================================================
// Capability: Stageable
// =============================================================================

/// Stage/unstage lifecycle around a file series.
///
/// # Contract
/// - `stage` fails with `Lifecycle` while already staged.
/// - `unstage` is idempotent and always leaves the device unstaged.
#[async_trait]
pub trait Stageable: Send + Sync {
    /// Open a new resource and clear the datum cache.
    async fn stage(&self, request: &StageRequest) -> AppResult<ResourceDoc>;

    /// Close the resource and clear the datum cache.
    async fn unstage(&self) -> AppResult<()>;

    /// Whether a resource is open
    fn is_staged(&self) -> bool;
}

// =============================================================================
// Capability: Acquirable
// =============================================================================

/// Access to the controllers that own the device's status channels.
pub trait Acquirable: Send + Sync {
    /// Controller owning `status_channel` (full or prefix-relative name).
    fn controller(&self, status_channel: &str) -> AppResult<AcquisitionController>;
}

// =============================================================================
// Capability: AssetRegistry
// =============================================================================

/// Provenance bookkeeping for produced files.
pub trait AssetRegistry: Send + Sync {
    /// Reference the next slot of the staged resource.
    ///
    /// Fails with `Lifecycle` while unstaged.
    fn generate_datum(
        &self,
        key: &str,
        params: serde_json::Map<String, serde_json::Value>,
    ) -> AppResult<DatumDoc>;

    /// Drain queued Resource and Datum documents.
    fn collect_asset_docs(&self) -> Vec<Document>;

    /// Absolute path of `filename` inside the staged series.
    fn artifact_path(&self, filename: &str) -> AppResult<PathBuf>;
}

/// Everything the trigger orchestrator needs from a detector.
pub trait AreaDetector: Configurable + Stageable + Acquirable + AssetRegistry {}

impl<T> AreaDetector for T where T: Configurable + Stageable + Acquirable + AssetRegistry {}
