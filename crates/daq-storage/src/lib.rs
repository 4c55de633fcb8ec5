//! Provenance tracking for files written by pe-daq detectors.

pub mod resource_tracker;

pub use resource_tracker::{
    compose_path, DatumReference, ResourceDescriptor, ResourceTracker, ADC_TIFF,
};
