//! `daq-core`
//!
//! Channel registry, completion watchers and the single-flight acquisition
//! state machine shared by every pe-daq crate.
//!
//! ## Layers
//!
//! - **ChannelStore**: table-built registry of typed, observable channels
//!   addressed by name (`set`/`get`/`subscribe`/`unsubscribe`)
//! - **CompletionWatcher**: one-shot, edge-triggered observer of a channel
//! - **AcquisitionController**: single-flight job runner that owns a status
//!   channel and shares one result with every concurrent caller
//! - **Capabilities**: the traits a detector implements for the orchestrator
//! - **Documents**: Start/Descriptor/Resource/Datum/Event/Stop run documents
//!
//! ## Example
//!
//! ```rust,no_run
//! use daq_core::channel::{ChannelSpec, ChannelStore};
//! # fn example() -> daq_core::AppResult<()> {
//! let store = ChannelStore::from_table(
//!     "PE1:",
//!     vec![ChannelSpec::float("cam1:AcquireTime", 1.0).with_readback()],
//! )?;
//! store.set("cam1:AcquireTime", 0.5)?;
//! assert_eq!(store.get_f64("cam1:AcquireTime_RBV")?, 0.5);
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod capabilities;
pub mod channel;
pub mod error;
pub mod experiment;
pub mod observable;
pub mod watcher;

pub use acquisition::{
    AcquisitionController, AcquisitionRequest, AcquisitionState, AcquisitionWork, Completion,
    CompletionResult, ControllerConfig,
};
pub use capabilities::{
    Acquirable, AreaDetector, AssetRegistry, Configurable, StageRequest, Stageable,
};
pub use channel::{ChannelSpec, ChannelStore, ChannelType, ChannelValue, SubscriptionHandle};
pub use error::{AppResult, DaqError, DriverError, DriverErrorKind};
pub use watcher::{await_transition, falling_edge, CompletionWatcher, PendingCompletion, Transition};
