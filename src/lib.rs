//! Chunkyard library: a resumable chunked-upload server.
//!
//! This crate provides the pieces of a tus 1.0.0 upload server: a
//! serialized on-disk metadata store, a chunk datastore, the upload
//! protocol engine with its lifecycle hooks, the pre-flight existence
//! guard, the expiry reaper, and the axum HTTP adapter.

use std::sync::Arc;

pub mod config;
pub mod engine;
pub mod errors;
pub mod guard;
pub mod hooks;
pub mod metadata;
pub mod metrics;
pub mod protocol;
pub mod reaper;
pub mod server;
pub mod storage;

#[cfg(test)]
mod testutil;

use crate::config::Config;
use crate::engine::UploadEngine;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The upload protocol engine.
    pub engine: Arc<UploadEngine>,
}
