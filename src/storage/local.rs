//! Local filesystem chunk datastore.
//!
//! Payloads are stored as flat files directly under a configurable root
//! directory, one file per upload id. Chunks are written in place at the
//! declared offset; the metadata store keeps the `{id}.json` sibling.

use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::backend::{BoxedReader, ChunkDatastore, PathEscape};

/// Copy buffer size for streamed chunk writes.
const WRITE_BUFFER: usize = 256 * 1024;

/// Resolve `name` to a path directly under `root`.
///
/// The joined path must start with `root` and must equal
/// `root.join(basename(name))` exactly. Separators, parent references,
/// absolute paths and dot-files (which would collide with the store's
/// own scratch directory) are all rejected.
pub fn resolve_within(root: &Path, name: &str) -> Result<PathBuf, PathEscape> {
    let reject = || PathEscape {
        name: name.to_string(),
    };

    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return Err(reject());
    }

    let basename = Path::new(name).file_name().ok_or_else(reject)?;
    let joined = root.join(name);
    if !joined.starts_with(root) || joined != root.join(basename) {
        return Err(reject());
    }
    Ok(joined)
}

/// Stores upload payloads on the local filesystem.
pub struct LocalDatastore {
    /// Absolute root directory for all payloads.
    root: PathBuf,
}

impl LocalDatastore {
    /// Create a new `LocalDatastore` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }
}

impl ChunkDatastore for LocalDatastore {
    fn directory(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, id: &str) -> Result<PathBuf, PathEscape> {
        resolve_within(&self.root, id)
    }

    fn create(&self, id: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let path = self.resolve(id);
        Box::pin(async move {
            let path = path?;
            let file = tokio::fs::File::create(&path).await?;
            file.sync_all().await?;
            Ok(())
        })
    }

    fn write(
        &self,
        id: &str,
        offset: u64,
        reader: BoxedReader,
        limit: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let path = self.resolve(id);
        let id = id.to_string();
        Box::pin(async move {
            let path = path?;
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await?;
            file.seek(SeekFrom::Start(offset)).await?;

            let mut reader: BoxedReader = match limit {
                Some(limit) => Box::pin(reader.take(limit)),
                None => reader,
            };

            let mut buf = vec![0u8; WRITE_BUFFER];
            let mut written: u64 = 0;
            let copy_result: anyhow::Result<()> = async {
                loop {
                    let n = reader.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    file.write_all(&buf[..n]).await?;
                    written += n as u64;
                }
                Ok(())
            }
            .await;

            // Whatever made it to the file stays durable, even on a broken body.
            file.flush().await?;
            file.sync_data().await?;

            debug!(id = %id, offset, written, "chunk written");
            copy_result.map(|()| written)
        })
    }

    fn file_size(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<u64>>> + Send + '_>> {
        let path = self.resolve(id);
        Box::pin(async move {
            let path = path?;
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
                Ok(_) => Ok(None),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn open(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BoxedReader>> + Send + '_>> {
        let path = self.resolve(id);
        Box::pin(async move {
            let file = tokio::fs::File::open(path?).await?;
            Ok(Box::pin(file) as BoxedReader)
        })
    }

    fn remove(&self, id: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let path = self.resolve(id);
        Box::pin(async move {
            match tokio::fs::remove_file(path?).await {
                Ok(()) => Ok(()),
                // Idempotent: if the file doesn't exist, that's fine.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
