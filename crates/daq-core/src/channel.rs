//! Channel store: the request/response plus subscription surface of a device.
//!
//! A [`ChannelStore`] is built once from a table of [`ChannelSpec`]s and never
//! grows or shrinks afterwards. Each channel is an
//! [`Observable<ChannelValue>`](crate::observable::Observable) plus a table of
//! synchronous transition callbacks.
//!
//! # Writer roles
//!
//! Every channel has exactly one [`WriterRole`]:
//!
//! | Role | `set` (external) | `commit` (owner) |
//! |------|------------------|------------------|
//! | `External` | accepted | accepted |
//! | `Device` (readbacks, identity) | rejected | accepted |
//! | `Controller` (status channels) | rejected | accepted |
//!
//! # Notification order
//!
//! A commit stores the value, mirrors it into the `_RBV` readback (if any) and
//! then invokes callbacks with `(old, new)`, outside of any lock. Callbacks run
//! on every commit, including commits that do not change the value, so edge
//! predicates must compare `old` and `new` themselves. A callback registered
//! while a commit is notifying does not see that commit.

use crate::error::{AppResult, DaqError};
use crate::observable::{Observable, ObservableMetadata};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Suffix appended to a channel name to form its readback mirror.
pub const READBACK_SUFFIX: &str = "_RBV";

// =============================================================================
// Values and types
// =============================================================================

/// A value carried by a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelValue {
    /// Integer (also the storage form of enum channels)
    Int(i64),
    /// Floating point
    Float(f64),
    /// Text
    Str(String),
}

impl ChannelValue {
    /// Integer view. Floats are not truncated.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ChannelValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view of ints and floats.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ChannelValue::Int(v) => Some(*v as f64),
            ChannelValue::Float(v) => Some(*v),
            ChannelValue::Str(_) => None,
        }
    }

    /// Text view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ChannelValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelValue::Int(v) => write!(f, "{}", v),
            ChannelValue::Float(v) => write!(f, "{}", v),
            ChannelValue::Str(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for ChannelValue {
    fn from(v: i64) -> Self {
        ChannelValue::Int(v)
    }
}

impl From<i32> for ChannelValue {
    fn from(v: i32) -> Self {
        ChannelValue::Int(i64::from(v))
    }
}

impl From<f64> for ChannelValue {
    fn from(v: f64) -> Self {
        ChannelValue::Float(v)
    }
}

impl From<&str> for ChannelValue {
    fn from(v: &str) -> Self {
        ChannelValue::Str(v.to_string())
    }
}

impl From<String> for ChannelValue {
    fn from(v: String) -> Self {
        ChannelValue::Str(v)
    }
}

/// Declared type of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    /// Integer
    Int,
    /// Floating point; integers are widened on write
    Float,
    /// Text
    String,
    /// Integer index into the channel's enum strings; labels are accepted on write
    Enum,
}

impl ChannelType {
    /// dtype hint stored in the channel metadata
    pub fn dtype(&self) -> &'static str {
        match self {
            ChannelType::Int => "int",
            ChannelType::Float => "float",
            ChannelType::String => "string",
            ChannelType::Enum => "enum",
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dtype())
    }
}

/// Who may write a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterRole {
    /// Configuration channels written by callers
    External,
    /// Readbacks and identity channels written by the device itself
    Device,
    /// Status channels written only by an acquisition controller
    Controller,
}

impl std::fmt::Display for WriterRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriterRole::External => write!(f, "external"),
            WriterRole::Device => write!(f, "read-only"),
            WriterRole::Controller => write!(f, "status-owned"),
        }
    }
}

// =============================================================================
// Channel table
// =============================================================================

/// Device-side reaction to an accepted external write.
///
/// Runs after the value is committed and its subscribers were notified.
pub type WriteHook = Arc<dyn Fn(&ChannelStore, &ChannelValue) -> AppResult<()> + Send + Sync>;

/// Value check run before a commit is stored.
pub type ChannelValidator = Arc<dyn Fn(&ChannelValue) -> anyhow::Result<()> + Send + Sync>;

/// Transition callback. Return `ControlFlow::Break(())` to deregister.
pub type ChannelCallback =
    Arc<dyn Fn(&ChannelValue, &ChannelValue) -> ControlFlow<()> + Send + Sync>;

/// One row of a channel table.
#[derive(Clone)]
pub struct ChannelSpec {
    /// Name relative to the store prefix
    pub name: String,
    /// Declared type
    pub dtype: ChannelType,
    /// Value at construction
    pub initial: ChannelValue,
    /// Labels for enum channels
    pub enum_strings: Vec<String>,
    /// Writer role
    pub writer: WriterRole,
    /// Whether a `_RBV` mirror is created
    pub readback: bool,
    /// Optional description
    pub description: Option<String>,
    /// Optional physical units
    pub units: Option<String>,
    /// Optional device reaction to external writes
    pub on_write: Option<WriteHook>,
    /// Optional range or format check, applied to every commit
    pub validator: Option<ChannelValidator>,
}

impl std::fmt::Debug for ChannelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSpec")
            .field("name", &self.name)
            .field("dtype", &self.dtype)
            .field("initial", &self.initial)
            .field("writer", &self.writer)
            .field("readback", &self.readback)
            .field("has_hook", &self.on_write.is_some())
            .field("has_validator", &self.validator.is_some())
            .finish_non_exhaustive()
    }
}

impl ChannelSpec {
    fn new(name: &str, dtype: ChannelType, initial: ChannelValue) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            initial,
            enum_strings: Vec::new(),
            writer: WriterRole::External,
            readback: false,
            description: None,
            units: None,
            on_write: None,
            validator: None,
        }
    }

    /// Integer channel
    pub fn int(name: &str, initial: i64) -> Self {
        Self::new(name, ChannelType::Int, ChannelValue::Int(initial))
    }

    /// Float channel
    pub fn float(name: &str, initial: f64) -> Self {
        Self::new(name, ChannelType::Float, ChannelValue::Float(initial))
    }

    /// String channel
    pub fn string(name: &str, initial: &str) -> Self {
        Self::new(name, ChannelType::String, ChannelValue::from(initial))
    }

    /// Enum channel with labels and an initial index
    pub fn enumeration(name: &str, choices: &[&str], initial: i64) -> Self {
        let mut spec = Self::new(name, ChannelType::Enum, ChannelValue::Int(initial));
        spec.enum_strings = choices.iter().map(|s| (*s).to_string()).collect();
        spec
    }

    /// Written by the device only
    pub fn read_only(mut self) -> Self {
        self.writer = WriterRole::Device;
        self
    }

    /// Written by an acquisition controller only
    pub fn status(mut self) -> Self {
        self.writer = WriterRole::Controller;
        self
    }

    /// Create a `_RBV` mirror updated on every commit
    pub fn with_readback(mut self) -> Self {
        self.readback = true;
        self
    }

    /// Attach a description
    pub fn describe(mut self, text: &str) -> Self {
        self.description = Some(text.to_string());
        self
    }

    /// Attach units
    pub fn units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    /// Attach a device reaction to external writes
    pub fn on_write<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ChannelStore, &ChannelValue) -> AppResult<()> + Send + Sync + 'static,
    {
        self.on_write = Some(Arc::new(hook));
        self
    }

    /// Reject values failing `check`; the error becomes `Configuration`.
    pub fn with_validator<F>(mut self, check: F) -> Self
    where
        F: Fn(&ChannelValue) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(check));
        self
    }

    /// Float or int channel that only accepts finite values above zero.
    pub fn positive(self) -> Self {
        self.with_validator(|value| match value.as_f64() {
            Some(v) if v.is_finite() && v > 0.0 => Ok(()),
            _ => Err(anyhow::anyhow!("must be a finite value above zero, got {}", value)),
        })
    }
}

// =============================================================================
// Store
// =============================================================================

/// Handle returned by [`ChannelStore::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    channel: String,
    id: u64,
}

impl SubscriptionHandle {
    /// Full name of the subscribed channel
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

struct Channel {
    cell: Observable<ChannelValue>,
    dtype: ChannelType,
    enum_strings: Vec<String>,
    writer: WriterRole,
    readback: Option<String>,
    on_write: Option<WriteHook>,
    subscribers: Mutex<Vec<(u64, ChannelCallback)>>,
    write_lock: ReentrantMutex<()>,
}

struct StoreInner {
    prefix: String,
    channels: BTreeMap<String, Channel>,
    next_subscription: AtomicU64,
}

/// In-memory registry of named, typed channels.
///
/// Cheap to clone; clones share the same channels.
#[derive(Clone)]
pub struct ChannelStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for ChannelStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStore")
            .field("prefix", &self.inner.prefix)
            .field("channels", &self.inner.channels.len())
            .finish()
    }
}

impl ChannelStore {
    /// Build the store from a channel table. Names are prefixed with `prefix`.
    pub fn from_table(prefix: &str, table: Vec<ChannelSpec>) -> AppResult<Self> {
        let mut channels = BTreeMap::new();

        for spec in table {
            let full = format!("{}{}", prefix, spec.name);
            let readback = spec
                .readback
                .then(|| format!("{}{}", full, READBACK_SUFFIX));

            if let Some(rbv) = &readback {
                let mirror = Self::build_channel(
                    rbv,
                    &spec,
                    WriterRole::Device,
                    None,
                    Some(format!("Readback of {}", full)),
                )?;
                if channels.insert(rbv.clone(), mirror).is_some() {
                    return Err(DaqError::Configuration(format!(
                        "Duplicate channel '{}'",
                        rbv
                    )));
                }
            }

            let channel = Self::build_channel(
                &full,
                &spec,
                spec.writer,
                readback,
                spec.description.clone(),
            )?;
            if channels.insert(full.clone(), channel).is_some() {
                return Err(DaqError::Configuration(format!(
                    "Duplicate channel '{}'",
                    full
                )));
            }
        }

        debug!(prefix = %prefix, channels = channels.len(), "Channel store built");

        Ok(Self {
            inner: Arc::new(StoreInner {
                prefix: prefix.to_string(),
                channels,
                next_subscription: AtomicU64::new(1),
            }),
        })
    }

    fn build_channel(
        full: &str,
        spec: &ChannelSpec,
        writer: WriterRole,
        readback: Option<String>,
        description: Option<String>,
    ) -> AppResult<Channel> {
        let initial = coerce(full, spec.dtype, &spec.enum_strings, spec.initial.clone())?;

        let mut cell = Observable::new(full, initial).with_dtype(spec.dtype.dtype());
        if spec.dtype == ChannelType::Enum {
            cell = cell.with_choices(spec.enum_strings.clone());
        }
        if writer != WriterRole::External {
            cell = cell.read_only();
        }
        if let Some(text) = description {
            cell = cell.with_description(text);
        }
        if let Some(units) = &spec.units {
            cell = cell.with_units(units.clone());
        }
        if let Some(check) = &spec.validator {
            let check = check.clone();
            cell = cell.with_validator(move |value| check(value));
        }

        Ok(Channel {
            cell,
            dtype: spec.dtype,
            enum_strings: spec.enum_strings.clone(),
            writer,
            readback,
            on_write: spec.on_write.clone(),
            subscribers: Mutex::new(Vec::new()),
            write_lock: ReentrantMutex::new(()),
        })
    }

    /// Common prefix of every channel name
    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    /// Resolve a full or prefix-relative name.
    fn lookup(&self, name: &str) -> AppResult<(&str, &Channel)> {
        if let Some((full, channel)) = self.inner.channels.get_key_value(name) {
            return Ok((full.as_str(), channel));
        }
        let prefixed = format!("{}{}", self.inner.prefix, name);
        self.inner
            .channels
            .get_key_value(&prefixed)
            .map(|(full, channel)| (full.as_str(), channel))
            .ok_or_else(|| DaqError::Configuration(format!("Unknown channel '{}'", name)))
    }

    /// Full name of a channel given either form.
    pub fn full_name(&self, name: &str) -> AppResult<String> {
        self.lookup(name).map(|(full, _)| full.to_string())
    }

    /// Whether the channel exists.
    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_ok()
    }

    /// All full channel names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.inner.channels.keys().cloned().collect()
    }

    /// Current value.
    pub fn get(&self, name: &str) -> AppResult<ChannelValue> {
        self.lookup(name).map(|(_, channel)| channel.cell.get())
    }

    /// Current value as a float.
    pub fn get_f64(&self, name: &str) -> AppResult<f64> {
        let value = self.get(name)?;
        value.as_f64().ok_or_else(|| {
            DaqError::Configuration(format!("Channel '{}' holds non-numeric {}", name, value))
        })
    }

    /// Current value as an integer.
    pub fn get_i64(&self, name: &str) -> AppResult<i64> {
        let value = self.get(name)?;
        value.as_i64().ok_or_else(|| {
            DaqError::Configuration(format!("Channel '{}' holds non-integer {}", name, value))
        })
    }

    /// Label of the current value of an enum channel.
    pub fn enum_label(&self, name: &str) -> AppResult<Option<String>> {
        let (_, channel) = self.lookup(name)?;
        let label = channel
            .cell
            .get()
            .as_i64()
            .and_then(|idx| usize::try_from(idx).ok())
            .and_then(|idx| channel.enum_strings.get(idx).cloned());
        Ok(label)
    }

    /// Metadata of a channel.
    pub fn metadata(&self, name: &str) -> AppResult<ObservableMetadata> {
        self.lookup(name).map(|(_, channel)| channel.cell.metadata())
    }

    /// Coerce a value to the channel's type without writing it.
    pub fn normalize(&self, name: &str, value: ChannelValue) -> AppResult<ChannelValue> {
        let (full, channel) = self.lookup(name)?;
        coerce(full, channel.dtype, &channel.enum_strings, value)
    }

    /// External write.
    ///
    /// Fails with `Configuration` for unknown channels, channels whose writer
    /// role is not `External`, and values that do not fit the channel type.
    pub fn set(&self, name: &str, value: impl Into<ChannelValue>) -> AppResult<()> {
        let (full, channel) = self.lookup(name)?;
        if channel.writer != WriterRole::External {
            return Err(DaqError::Configuration(format!(
                "Channel '{}' is {} and rejects external writes",
                full, channel.writer
            )));
        }

        let committed = self.commit_to(full, channel, value.into())?;

        if let Some(hook) = &channel.on_write {
            hook(self, &committed)?;
        }
        Ok(())
    }

    /// Owner write. Bypasses the writer role but still type-checks.
    pub fn commit(&self, name: &str, value: impl Into<ChannelValue>) -> AppResult<()> {
        let (full, channel) = self.lookup(name)?;
        self.commit_to(full, channel, value.into()).map(|_| ())
    }

    fn commit_to(
        &self,
        full: &str,
        channel: &Channel,
        value: ChannelValue,
    ) -> AppResult<ChannelValue> {
        let value = coerce(full, channel.dtype, &channel.enum_strings, value)?;
        channel
            .cell
            .validate_value(&value)
            .map_err(|e| DaqError::Configuration(format!("Channel '{}' {}", full, e)))?;

        // Serialises commits per channel; reentrant so callbacks may write back.
        let _guard = channel.write_lock.lock();

        let old = channel.cell.replace_unchecked(value.clone());
        trace!(channel = %full, old = %old, new = %value, "Committed");

        if let Some(rbv) = &channel.readback {
            if let Some(mirror) = self.inner.channels.get(rbv) {
                self.commit_to(rbv, mirror, value.clone())?;
            }
        }

        self.notify(channel, &old, &value);
        Ok(value)
    }

    fn notify(&self, channel: &Channel, old: &ChannelValue, new: &ChannelValue) {
        let callbacks: Vec<(u64, ChannelCallback)> = channel.subscribers.lock().clone();
        if callbacks.is_empty() {
            return;
        }

        let finished: Vec<u64> = callbacks
            .into_iter()
            .filter_map(|(id, callback)| callback(old, new).is_break().then_some(id))
            .collect();

        if !finished.is_empty() {
            channel
                .subscribers
                .lock()
                .retain(|(id, _)| !finished.contains(id));
        }
    }

    /// Register a transition callback, invoked with `(old, new)` on every commit.
    pub fn subscribe<F>(&self, name: &str, callback: F) -> AppResult<SubscriptionHandle>
    where
        F: Fn(&ChannelValue, &ChannelValue) -> ControlFlow<()> + Send + Sync + 'static,
    {
        let (full, channel) = self.lookup(name)?;
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        channel.subscribers.lock().push((id, Arc::new(callback)));
        trace!(channel = %full, subscription = id, "Subscribed");
        Ok(SubscriptionHandle {
            channel: full.to_string(),
            id,
        })
    }

    /// Remove a callback. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let Some(channel) = self.inner.channels.get(&handle.channel) else {
            return false;
        };
        let mut subscribers = channel.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != handle.id);
        subscribers.len() != before
    }

    /// Number of live callbacks on a channel.
    pub fn subscriber_count(&self, name: &str) -> AppResult<usize> {
        self.lookup(name)
            .map(|(_, channel)| channel.subscribers.lock().len())
    }

    /// Async value stream of a channel.
    pub fn watch(&self, name: &str) -> AppResult<watch::Receiver<ChannelValue>> {
        self.lookup(name).map(|(_, channel)| channel.cell.subscribe())
    }

    /// Every channel's current value as JSON, keyed by full name.
    pub fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        self.inner
            .channels
            .iter()
            .filter_map(|(name, channel)| {
                channel.cell.get_json().ok().map(|json| (name.clone(), json))
            })
            .collect()
    }
}

#[allow(clippy::cast_precision_loss)]
fn coerce(
    full: &str,
    dtype: ChannelType,
    enum_strings: &[String],
    value: ChannelValue,
) -> AppResult<ChannelValue> {
    match (dtype, value) {
        (ChannelType::Int, v @ ChannelValue::Int(_)) => Ok(v),
        (ChannelType::Float, v @ ChannelValue::Float(_)) => Ok(v),
        (ChannelType::Float, ChannelValue::Int(v)) => Ok(ChannelValue::Float(v as f64)),
        (ChannelType::String, v @ ChannelValue::Str(_)) => Ok(v),
        (ChannelType::Enum, ChannelValue::Int(idx))
            if usize::try_from(idx).is_ok_and(|i| i < enum_strings.len()) =>
        {
            Ok(ChannelValue::Int(idx))
        }
        (ChannelType::Enum, ChannelValue::Str(label)) => enum_strings
            .iter()
            .position(|choice| *choice == label)
            .and_then(|idx| i64::try_from(idx).ok())
            .map(ChannelValue::Int)
            .ok_or_else(|| {
                DaqError::Configuration(format!(
                    "Channel '{}' has no choice {:?} (choices: {})",
                    full,
                    label,
                    enum_strings.join(", ")
                ))
            }),
        (dtype, value) => Err(DaqError::Configuration(format!(
            "Channel '{}' expects {} value, got {}",
            full, dtype, value
        ))),
    }
}
