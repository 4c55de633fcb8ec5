//! File provenance: resources and datums.
//!
//! A [`ResourceTracker`] binds the files a detector writes during one
//! stage/unstage cycle to a single resource identity, and hands out one datum
//! reference per acquisition. Event documents carry the datum id instead of
//! pixel data; a reader resolves `datum_id -> resource -> file` through the
//! handler named by the resource `spec`.
//!
//! # Lifecycle
//!
//! ```text
//!            stage()                     unstage()
//! Unstaged ───────────▶ Staged{seq = 0} ───────────▶ Unstaged
//!    │                    │   ▲                        (idempotent)
//!    │ generate_datum()   │   │ generate_datum()
//!    ▼                    └───┘ seq += 1
//! Lifecycle error
//! ```
//!
//! Sequence numbers restart at 0 on every stage. Queued Resource and Datum
//! documents survive unstage until drained by [`ResourceTracker::collect_asset_docs`].

use daq_core::capabilities::StageRequest;
use daq_core::error::{AppResult, DaqError};
use daq_core::experiment::{new_uid, DatumDoc, Document, ResourceDoc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Handler spec for area-detector TIFF series.
pub const ADC_TIFF: &str = "ADC_TIFF";

/// `root / relative_path / filename`
pub fn compose_path(root: &Path, relative_path: &Path, filename: &str) -> PathBuf {
    root.join(relative_path).join(filename)
}

/// The file series of one stage/unstage cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDescriptor {
    /// Fresh per stage
    pub uid: String,
    /// Handler spec, `ADC_TIFF` by default
    pub spec: String,
    /// Absolute root
    pub root: PathBuf,
    /// Series directory below `root`
    pub relative_path: PathBuf,
    /// Handler arguments (`template`, `frame_per_point`)
    pub resource_kwargs: BTreeMap<String, Value>,
}

impl ResourceDescriptor {
    /// Absolute path of `filename` in this series.
    pub fn artifact_path(&self, filename: &str) -> PathBuf {
        compose_path(&self.root, &self.relative_path, filename)
    }

    /// Resource document, optionally linked to a run
    pub fn to_document(&self, run_start: Option<&str>) -> ResourceDoc {
        ResourceDoc {
            uid: self.uid.clone(),
            spec: self.spec.clone(),
            root: self.root.to_string_lossy().into_owned(),
            resource_path: self.relative_path.to_string_lossy().into_owned(),
            resource_kwargs: self.resource_kwargs.clone(),
            run_start: run_start.map(str::to_string),
        }
    }
}

/// One slot of a resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatumReference {
    /// Owning resource
    pub resource_uid: String,
    /// `<resource uid>/<seq>`
    pub datum_id: String,
    /// Sequence within the stage cycle, from 0
    pub seq: u64,
    /// Event field the datum fills
    pub key: String,
    /// `point_number`, `timestamp` and caller parameters
    pub datum_kwargs: BTreeMap<String, Value>,
}

impl DatumReference {
    /// Datum document for this slot
    pub fn to_document(&self) -> DatumDoc {
        DatumDoc {
            resource_uid: self.resource_uid.clone(),
            datum_id: self.datum_id.clone(),
            datum_kwargs: self.datum_kwargs.clone(),
        }
    }
}

struct Staged {
    descriptor: ResourceDescriptor,
    next_seq: u64,
    datums: Vec<DatumReference>,
}

#[derive(Default)]
struct TrackerState {
    staged: Option<Staged>,
    pending: Vec<Document>,
}

/// Owns the live resource descriptor and its datum cache.
pub struct ResourceTracker {
    spec: String,
    frame_per_point: u64,
    state: Mutex<TrackerState>,
}

impl Default for ResourceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("spec", &self.spec)
            .field("staged", &self.is_staged())
            .field("datums", &self.datum_count())
            .finish()
    }
}

impl ResourceTracker {
    /// Tracker for `ADC_TIFF` series, one frame per point.
    pub fn new() -> Self {
        Self::with_spec(ADC_TIFF)
    }

    /// Tracker for another handler spec
    pub fn with_spec(spec: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            frame_per_point: 1,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Handler spec stamped on every resource
    pub fn spec(&self) -> &str {
        &self.spec
    }

    /// Open a new resource.
    ///
    /// `root` must be absolute and `relative_path` relative. Queues a
    /// Resource document.
    pub fn stage(&self, request: &StageRequest) -> AppResult<ResourceDescriptor> {
        if !request.root.is_absolute() {
            return Err(DaqError::Configuration(format!(
                "Resource root '{}' is not absolute",
                request.root.display()
            )));
        }
        if request.relative_path.is_absolute() {
            return Err(DaqError::Configuration(format!(
                "Resource path '{}' must be relative to the root",
                request.relative_path.display()
            )));
        }

        let mut state = self.state.lock();
        if let Some(staged) = &state.staged {
            return Err(DaqError::Lifecycle(format!(
                "Already staged (resource {})",
                staged.descriptor.uid
            )));
        }

        let mut resource_kwargs = BTreeMap::new();
        resource_kwargs.insert(
            "template".to_string(),
            Value::String(request.naming_template.clone()),
        );
        resource_kwargs.insert("frame_per_point".to_string(), Value::from(self.frame_per_point));

        let descriptor = ResourceDescriptor {
            uid: new_uid(),
            spec: self.spec.clone(),
            root: request.root.clone(),
            relative_path: request.relative_path.clone(),
            resource_kwargs,
        };
        state.pending.push(Document::Resource(
            descriptor.to_document(request.run_start.as_deref()),
        ));
        state.staged = Some(Staged {
            descriptor: descriptor.clone(),
            next_seq: 0,
            datums: Vec::new(),
        });

        info!(
            resource = %descriptor.uid,
            spec = %descriptor.spec,
            path = %descriptor.artifact_path("").display(),
            "Resource staged"
        );
        Ok(descriptor)
    }

    /// Reference the next slot of the staged resource.
    ///
    /// `point_number` and `timestamp` are always set by the tracker; caller
    /// `params` cannot override them.
    pub fn generate_datum(
        &self,
        key: &str,
        timestamp: f64,
        params: Map<String, Value>,
    ) -> AppResult<DatumReference> {
        let mut state = self.state.lock();
        let staged = state.staged.as_mut().ok_or_else(|| {
            DaqError::Lifecycle(format!("Cannot generate datum for '{}' while unstaged", key))
        })?;

        let seq = staged.next_seq;
        staged.next_seq += 1;

        let mut datum_kwargs: BTreeMap<String, Value> = params.into_iter().collect();
        datum_kwargs.insert("point_number".to_string(), Value::from(seq));
        datum_kwargs.insert("timestamp".to_string(), Value::from(timestamp));

        let datum = DatumReference {
            resource_uid: staged.descriptor.uid.clone(),
            datum_id: format!("{}/{}", staged.descriptor.uid, seq),
            seq,
            key: key.to_string(),
            datum_kwargs,
        };
        staged.datums.push(datum.clone());
        state.pending.push(Document::Datum(datum.to_document()));

        debug!(datum = %datum.datum_id, key, "Datum generated");
        Ok(datum)
    }

    /// Close the resource and clear the datum cache. Returns the closed
    /// descriptor, or `None` if nothing was staged.
    /// Close the resource and drop the datum cache. Idempotent.
    ///
    /// Queued documents stay until [`collect_asset_docs`](Self::collect_asset_docs).
    pub fn unstage(&self) -> Option<ResourceDescriptor> {
        let closed = self.state.lock().staged.take();
        match closed {
            Some(staged) => {
                info!(
                    resource = %staged.descriptor.uid,
                    datums = staged.datums.len(),
                    "Resource unstaged"
                );
                Some(staged.descriptor)
            }
            None => {
                debug!("Unstage while unstaged");
                None
            }
        }
    }

    /// Whether a resource is open
    pub fn is_staged(&self) -> bool {
        self.state.lock().staged.is_some()
    }

    /// The live descriptor
    pub fn descriptor(&self) -> Option<ResourceDescriptor> {
        self.state
            .lock()
            .staged
            .as_ref()
            .map(|s| s.descriptor.clone())
    }

    /// Datums of the current cycle, in sequence order
    pub fn datums(&self) -> Vec<DatumReference> {
        self.state
            .lock()
            .staged
            .as_ref()
            .map(|s| s.datums.clone())
            .unwrap_or_default()
    }

    /// Datums generated since the last stage
    pub fn datum_count(&self) -> usize {
        self.state
            .lock()
            .staged
            .as_ref()
            .map_or(0, |s| s.datums.len())
    }

    /// Absolute path of `filename` in the staged series.
    pub fn artifact_path(&self, filename: &str) -> AppResult<PathBuf> {
        self.state
            .lock()
            .staged
            .as_ref()
            .map(|s| s.descriptor.artifact_path(filename))
            .ok_or_else(|| DaqError::Lifecycle("No resource staged".to_string()))
    }

    /// Drain queued Resource and Datum documents, oldest first.
    pub fn collect_asset_docs(&self) -> Vec<Document> {
        std::mem::take(&mut self.state.lock().pending)
    }
}
