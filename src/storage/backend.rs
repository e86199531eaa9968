//! Abstract chunk datastore trait.
//!
//! Every payload store must implement [`ChunkDatastore`].  The trait
//! works in terms of upload ids and async byte readers so the protocol
//! engine does not need to know the underlying medium.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::io::AsyncRead;

/// An owned, boxed async byte source (a request body, a file, a test buffer).
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// A computed payload name that would land outside the storage directory.
#[derive(Debug, thiserror::Error)]
#[error("file name escapes the storage directory: {name:?}")]
pub struct PathEscape {
    /// The offending name as received.
    pub name: String,
}

/// Async payload storage contract.
pub trait ChunkDatastore: Send + Sync + 'static {
    /// The directory every payload lives under.
    fn directory(&self) -> &Path;

    /// Map an upload id to its payload path, refusing anything that would
    /// escape [`directory`](Self::directory). Performs no I/O.
    fn resolve(&self, id: &str) -> Result<PathBuf, PathEscape>;

    /// Create (or truncate) an empty payload for `id`.
    fn create(&self, id: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Write bytes from `reader` starting at `offset`, reading at most
    /// `limit` bytes when given. Returns the number of bytes written.
    ///
    /// Bytes written before a reader failure stay on disk.
    fn write(
        &self,
        id: &str,
        offset: u64,
        reader: BoxedReader,
        limit: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>>;

    /// Current payload length, or `None` when there is no payload.
    fn file_size(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<u64>>> + Send + '_>>;

    /// Open the payload for reading.
    fn open(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BoxedReader>> + Send + '_>>;

    /// Remove the payload. Removing a missing payload succeeds.
    fn remove(&self, id: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}
