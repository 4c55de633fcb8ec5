//! Run documents.

pub mod document;

pub use document::{
    new_uid, now_ns, now_secs, DataKey, DatumDoc, DescriptorDoc, Document, EventDoc, ResourceDoc,
    StartDoc, StopDoc,
};
