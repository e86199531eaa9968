//! Metadata storage layer.
//!
//! [`record::UploadRecord`] is the persisted unit; [`store::MetadataStore`]
//! keeps one JSON file per upload next to its payload.

pub mod record;
pub mod store;
