//! Payload storage.
//!
//! The [`backend::ChunkDatastore`] trait abstracts over where upload bytes
//! live; [`local::LocalDatastore`] keeps them as flat files on disk.

pub mod backend;
pub mod local;
