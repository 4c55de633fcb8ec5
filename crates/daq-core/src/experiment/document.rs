//! Document model for acquisition runs with file provenance
//!
//! A run is described by a stream of documents broadcast to whatever sink is
//! listening (a JSON-lines printer, a test collector, a database writer):
//!
//! - **StartDoc**: run intent and metadata
//! - **DescriptorDoc**: schema of the `primary` stream plus a channel snapshot
//! - **ResourceDoc**: one file series (root, relative path, handler spec)
//! - **DatumDoc**: one slot inside a resource, referenced by an event
//! - **EventDoc**: per-acquisition record carrying datum ids, not pixels
//! - **StopDoc**: exit status and summary
//!
//! # Document Flow
//!
//! ```text
//! StartDoc (1)
//!    │
//!    ├── ResourceDoc (1 per stage)
//!    │       │
//!    │       └── DatumDoc (N, seq 0..N)
//!    │
//!    ├── DescriptorDoc (1, "primary")
//!    │       │
//!    │       └── EventDoc (N, one per acquisition, data -> datum_id)
//!    │
//! StopDoc (1)
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    Utc::now()
        .timestamp_nanos_opt()
        .map_or(0, |ns| u64::try_from(ns).unwrap_or(0))
}

/// Current timestamp in fractional seconds since Unix epoch
pub fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// Document types for acquisition runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    /// Run start - intent and metadata
    Start(StartDoc),
    /// Stream schema
    Descriptor(DescriptorDoc),
    /// File series created at stage
    Resource(ResourceDoc),
    /// Slot within a resource
    Datum(DatumDoc),
    /// Per-acquisition record
    Event(EventDoc),
    /// Run stop - completion status
    Stop(StopDoc),
}

impl Document {
    /// Document identifier (datum id for datums)
    pub fn uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.uid,
            Document::Resource(d) => &d.uid,
            Document::Datum(d) => &d.datum_id,
            Document::Event(d) => &d.uid,
            Document::Stop(d) => &d.uid,
        }
    }

    /// Run this document belongs to.
    ///
    /// Datums are linked through their resource, so they carry no run UID.
    pub fn run_uid(&self) -> Option<&str> {
        match self {
            Document::Start(d) => Some(&d.uid),
            Document::Descriptor(d) => Some(&d.run_uid),
            Document::Resource(d) => d.run_start.as_deref(),
            Document::Datum(_) => None,
            Document::Event(d) => Some(&d.run_uid),
            Document::Stop(d) => Some(&d.run_uid),
        }
    }

    /// Short name of the document kind
    pub fn kind(&self) -> &'static str {
        match self {
            Document::Start(_) => "start",
            Document::Descriptor(_) => "descriptor",
            Document::Resource(_) => "resource",
            Document::Datum(_) => "datum",
            Document::Event(_) => "event",
            Document::Stop(_) => "stop",
        }
    }
}

/// Start document - emitted at the beginning of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run_uid)
    pub uid: String,
    /// Plan type that generated this run
    pub plan_type: String,
    /// User-friendly plan name
    pub plan_name: String,
    /// Plan arguments
    pub plan_args: HashMap<String, String>,
    /// User-provided metadata (proposal, cycle, ...)
    pub metadata: HashMap<String, String>,
    /// Names of the detectors driven by the plan
    pub detectors: Vec<String>,
    /// Timestamp when run started
    pub time_ns: u64,
}

impl StartDoc {
    /// Start document for a plan
    pub fn new(plan_type: &str, plan_name: &str) -> Self {
        Self {
            uid: new_uid(),
            plan_type: plan_type.to_string(),
            plan_name: plan_name.to_string(),
            plan_args: HashMap::new(),
            metadata: HashMap::new(),
            detectors: Vec::new(),
            time_ns: now_ns(),
        }
    }

    /// Record plan arguments
    pub fn with_args(mut self, args: HashMap<String, String>) -> Self {
        self.plan_args.extend(args);
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Add a participating detector
    pub fn with_detector(mut self, name: &str) -> Self {
        self.detectors.push(name.to_string());
        self
    }
}

/// Descriptor document - defines schema for event data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorDoc {
    /// Unique descriptor ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Stream name, `primary` for the count protocol
    pub name: String,
    /// Schema for data fields
    pub data_keys: HashMap<String, DataKey>,
    /// Channel snapshot at descriptor creation time
    pub configuration: BTreeMap<String, serde_json::Value>,
    /// Timestamp
    pub time_ns: u64,
}

impl DescriptorDoc {
    /// Descriptor for stream `name`
    pub fn new(run_uid: &str, name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            name: name.to_string(),
            data_keys: HashMap::new(),
            configuration: BTreeMap::new(),
            time_ns: now_ns(),
        }
    }

    /// Declare an event field
    pub fn with_data_key(mut self, name: &str, key: DataKey) -> Self {
        self.data_keys.insert(name.to_string(), key);
        self
    }

    /// Attach the device configuration snapshot
    pub fn with_configuration(mut self, configuration: BTreeMap<String, serde_json::Value>) -> Self {
        self.configuration = configuration;
        self
    }
}

/// Schema for a data field within events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataKey {
    /// Data type: "number", "integer", "string", "array"
    pub dtype: String,
    /// Shape for arrays (empty for scalars)
    pub shape: Vec<i32>,
    /// Source device or channel
    pub source: String,
    /// Physical units
    pub units: String,
    /// Set when event values are datum ids resolved through a handler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
}

impl DataKey {
    /// Create an image key whose values live in external files.
    pub fn external_array(source: &str, shape: Vec<i32>) -> Self {
        Self {
            dtype: "array".to_string(),
            shape,
            source: source.to_string(),
            units: String::new(),
            external: Some("FILESTORE:".to_string()),
        }
    }
}

/// Resource document - one file series bound to a stage/unstage cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDoc {
    /// Resource identifier
    pub uid: String,
    /// Handler spec, `ADC_TIFF` for the TIFF plugin
    pub spec: String,
    /// Absolute root, not part of the portable path
    pub root: String,
    /// Path of the series relative to `root`
    pub resource_path: String,
    /// Handler arguments (template, filename, frame_per_point)
    pub resource_kwargs: BTreeMap<String, serde_json::Value>,
    /// Owning run, when staged inside one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_start: Option<String>,
}

/// Datum document - one slot of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatumDoc {
    /// Owning resource
    pub resource_uid: String,
    /// `<resource uid>/<seq>`
    pub datum_id: String,
    /// Handler arguments for this slot (timestamp, point_number, ...)
    pub datum_kwargs: BTreeMap<String, serde_json::Value>,
}

/// Event document - one acquisition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDoc {
    /// Unique event ID
    pub uid: String,
    /// Links to StartDoc (for quick run lookup)
    pub run_uid: String,
    /// Links to DescriptorDoc that defines schema
    pub descriptor_uid: String,
    /// Event sequence number within the stream, starting at 1
    pub seq_num: u32,
    /// Timestamp
    pub time_ns: u64,
    /// Field values; external fields hold datum ids
    pub data: BTreeMap<String, serde_json::Value>,
    /// Per-field timestamps in seconds
    pub timestamps: BTreeMap<String, f64>,
    /// Whether external fields have been loaded (always false here)
    pub filled: BTreeMap<String, bool>,
}

impl EventDoc {
    /// Empty event `seq_num` of a descriptor
    pub fn new(run_uid: &str, descriptor_uid: &str, seq_num: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            descriptor_uid: descriptor_uid.to_string(),
            seq_num,
            time_ns: now_ns(),
            data: BTreeMap::new(),
            timestamps: BTreeMap::new(),
            filled: BTreeMap::new(),
        }
    }

    /// Reference an externally stored value by datum id.
    pub fn with_datum_ref(mut self, field: &str, datum: &DatumDoc) -> Self {
        let ts = datum
            .datum_kwargs
            .get("timestamp")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or_else(now_secs);
        self.data.insert(
            field.to_string(),
            serde_json::Value::String(datum.datum_id.clone()),
        );
        self.timestamps.insert(field.to_string(), ts);
        self.filled.insert(field.to_string(), false);
        self
    }
}

/// Stop document - emitted at the end of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDoc {
    /// Unique stop doc ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Exit status: "success" or "fail"
    pub exit_status: String,
    /// Reason for failure
    pub reason: String,
    /// Timestamp when run ended
    pub time_ns: u64,
    /// Total events emitted
    pub num_events: u32,
}

impl StopDoc {
    /// Run finished every repetition
    pub fn success(run_uid: &str, num_events: u32) -> Self {
        Self::with_status(run_uid, "success", "", num_events)
    }

    /// Run stopped at a failing step
    pub fn fail(run_uid: &str, reason: &str, num_events: u32) -> Self {
        Self::with_status(run_uid, "fail", reason, num_events)
    }

    fn with_status(run_uid: &str, status: &str, reason: &str, num_events: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status: status.to_string(),
            reason: reason.to_string(),
            time_ns: now_ns(),
            num_events,
        }
    }
}
