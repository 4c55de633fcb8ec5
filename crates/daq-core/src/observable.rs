//! Observable Values
//!
//! Reactive value cell using `tokio::sync::watch` for multi-subscriber
//! notifications. Every channel in the [`crate::channel::ChannelStore`] is one
//! `Observable<ChannelValue>`; async consumers use [`Observable::subscribe`],
//! synchronous edge observers go through the store's callback table.
//!
//! # Example
//!
//! ```rust,ignore
//! let exposure = Observable::new("cam1:AcquireTime", 1.0)
//!     .with_units("s")
//!     .with_validator(|v| if *v > 0.0 { Ok(()) } else { Err(anyhow!("must be positive")) });
//!
//! assert!(exposure.validate_value(&-1.0).is_err());
//! let mut rx = exposure.subscribe();
//! ```

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

// =============================================================================
// Type Aliases
// =============================================================================

/// Validator callback type.
pub type Validator<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

// =============================================================================
// Shared State
// =============================================================================

/// Metadata and validator shared by every clone of an Observable.
///
/// Uses `parking_lot::RwLock` because metadata access never needs to await.
struct ObservableSharedState<T> {
    metadata: ObservableMetadata,
    validator: Option<Validator<T>>,
}

/// Metadata for an observable value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservableMetadata {
    /// Value name (the full channel name for channel cells).
    pub name: String,

    /// Human-readable description.
    pub description: Option<String>,

    /// Physical units (e.g., "s", "counts").
    pub units: Option<String>,

    /// Whether external writers are rejected.
    pub read_only: bool,

    /// Data type hint: `"int"`, `"float"`, `"string"` or `"enum"`.
    #[serde(default)]
    pub dtype: String,

    /// Choice labels for `"enum"` values, indexed by the stored integer.
    #[serde(default)]
    pub enum_values: Vec<String>,
}

// =============================================================================
// Observable<T>
// =============================================================================

/// A thread-safe, observable value with change notifications.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The watch channel sender (holds current value)
    sender: watch::Sender<T>,
    /// Shared metadata and validator
    shared: Arc<RwLock<ObservableSharedState<T>>>,
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.read();
        f.debug_struct("Observable")
            .field("metadata", &shared.metadata)
            .field("has_validator", &shared.validator.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            sender,
            shared: Arc::new(RwLock::new(ObservableSharedState {
                metadata: ObservableMetadata {
                    name: name.into(),
                    description: None,
                    units: None,
                    read_only: false,
                    dtype: String::new(),
                    enum_values: Vec::new(),
                },
                validator: None,
            })),
        }
    }

    /// Add a description to this observable.
    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.shared.write().metadata.description = Some(description.into());
        self
    }

    /// Add units to this observable.
    pub fn with_units(self, units: impl Into<String>) -> Self {
        self.shared.write().metadata.units = Some(units.into());
        self
    }

    /// Set the dtype hint.
    pub fn with_dtype(self, dtype: impl Into<String>) -> Self {
        self.shared.write().metadata.dtype = dtype.into();
        self
    }

    /// Attach enum labels and mark the dtype as `"enum"`.
    pub fn with_choices(self, choices: Vec<String>) -> Self {
        {
            let mut guard = self.shared.write();
            guard.metadata.dtype = "enum".to_string();
            guard.metadata.enum_values = choices;
        }
        self
    }

    /// Mark this observable as read-only.
    pub fn read_only(self) -> Self {
        self.shared.write().metadata.read_only = true;
        self
    }

    /// Add a custom validator function.
    pub fn with_validator<F>(self, validator: F) -> Self
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        self.shared.write().validator = Some(Arc::new(validator));
        self
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Get the name.
    pub fn name(&self) -> String {
        self.shared.read().metadata.name.clone()
    }

    /// Get the metadata (returns a clone).
    pub fn metadata(&self) -> ObservableMetadata {
        self.shared.read().metadata.clone()
    }

    /// Run the validator, if any.
    pub fn validate_value(&self, value: &T) -> Result<()> {
        let guard = self.shared.read();
        if let Some(validator) = &guard.validator {
            validator(value)?;
        }
        Ok(())
    }

    /// Store without validation and return the previous value.
    ///
    /// The owning [`ChannelStore`](crate::channel::ChannelStore) checks the
    /// writer role and runs [`validate_value`](Self::validate_value) first.
    pub(crate) fn replace_unchecked(&self, value: T) -> T {
        self.sender.send_replace(value)
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + Serialize + 'static,
{
    /// Get the current value as JSON
    pub fn get_json(&self) -> Result<serde_json::Value> {
        let value = self.get();
        serde_json::to_value(&value)
            .map_err(|e| anyhow!("Failed to serialize '{}': {}", self.name(), e))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_observable_basic() {
        let obs = Observable::new("test", 42);
        assert_eq!(obs.get(), 42);
        assert_eq!(obs.name(), "test");

        assert_eq!(obs.replace_unchecked(100), 42);
        assert_eq!(obs.get(), 100);
    }

    #[test]
    fn test_observable_with_metadata() {
        let obs = Observable::new("cam1:AcquireTime", 1.0)
            .with_description("Exposure per frame")
            .with_units("s")
            .with_dtype("float");

        let meta = obs.metadata();
        assert_eq!(meta.units.as_deref(), Some("s"));
        assert_eq!(meta.dtype, "float");
        assert!(meta.description.is_some());
    }

    #[test]
    fn test_observable_validator() {
        let obs = Observable::new("rate", 10.0).with_validator(|v: &f64| {
            if *v > 0.0 {
                Ok(())
            } else {
                Err(anyhow!("must be positive"))
            }
        });

        assert!(obs.validate_value(&50.0).is_ok());
        assert!(obs.validate_value(&-1.0).is_err());
        assert_eq!(obs.get(), 10.0);
    }

    #[test]
    fn test_read_only_is_metadata_for_owner_writes() {
        let obs = Observable::new("cam1:Model_RBV", "Simulated".to_string()).read_only();
        assert!(obs.metadata().read_only);

        let old = obs.replace_unchecked("Other".to_string());
        assert_eq!(old, "Simulated");
        assert_eq!(obs.get(), "Other");
    }

    #[test]
    fn test_choices_mark_enum() {
        let obs = Observable::new("mode", 0i64)
            .with_choices(vec!["Single".to_string(), "Average".to_string()]);
        let meta = obs.metadata();
        assert_eq!(meta.dtype, "enum");
        assert_eq!(meta.enum_values.len(), 2);
    }

    #[tokio::test]
    async fn test_observable_subscription() {
        let obs = Observable::new("value", 0);
        let mut rx = obs.subscribe();

        assert_eq!(*rx.borrow(), 0);

        obs.replace_unchecked(42);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 42);
    }

    #[test]
    fn test_observable_json() {
        let obs = Observable::new("threshold", 100.0);
        assert_eq!(obs.get_json().unwrap(), serde_json::json!(100.0));
    }
}
