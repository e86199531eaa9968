//! Serialized JSON metadata store.
//!
//! One `{id}.json` file per upload, colocated with the `{id}` payload.
//! Every read and write goes through a single FIFO queue (a fair async
//! mutex), so concurrent requests never interleave writes to a metadata
//! file and never race a read against a write.
//!
//! Reads reconcile the stored `offset` against the real payload length:
//! the payload is the source of truth for durable bytes, the JSON file for
//! the declared size and caller metadata.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::record::UploadRecord;
use crate::storage::local::resolve_within;

/// Suffix of metadata files.
pub const METADATA_SUFFIX: &str = ".json";

/// Scratch directory for atomic metadata writes.
const TMP_DIR: &str = ".tmp";

/// Which of an upload's two files an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredFile {
    /// The `{id}.json` metadata file.
    Metadata,
    /// The raw `{id}` payload file.
    Payload,
}

/// Durable per-upload JSON records under one directory.
pub struct MetadataStore {
    root: PathBuf,
    queue: Mutex<()>,
}

impl MetadataStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(TMP_DIR))?;
        let root = root.canonicalize()?;
        Ok(Self {
            root,
            queue: Mutex::new(()),
        })
    }

    /// The directory this store owns.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str, file: StoredFile) -> anyhow::Result<PathBuf> {
        let payload = resolve_within(&self.root, id)?;
        Ok(match file {
            StoredFile::Payload => payload,
            StoredFile::Metadata => self.root.join(format!("{id}{METADATA_SUFFIX}")),
        })
    }

    /// Fetch the reconciled record for `id`.
    ///
    /// A missing or unparsable metadata file is reported as `None`, never
    /// as an error.
    pub async fn get(&self, id: &str) -> Option<UploadRecord> {
        let _turn = self.queue.lock().await;
        self.read_reconciled(id).await
    }

    /// Persist `record` under `id`, stripping derived data first.
    pub async fn set(&self, id: &str, record: &UploadRecord) -> anyhow::Result<()> {
        let _turn = self.queue.lock().await;
        self.write_record(id, record).await
    }

    /// Remove one of the upload's files. Best-effort: a missing file is a
    /// success and other I/O failures are logged, not returned.
    pub async fn delete(&self, id: &str, file: StoredFile) {
        let _turn = self.queue.lock().await;
        self.remove_file(id, file).await;
    }

    /// Remove both the metadata and the payload of `id`.
    pub async fn delete_all(&self, id: &str) {
        let _turn = self.queue.lock().await;
        self.remove_file(id, StoredFile::Metadata).await;
        self.remove_file(id, StoredFile::Payload).await;
    }

    /// Ids of every upload that has a metadata file.
    pub async fn list(&self) -> anyhow::Result<Vec<String>> {
        let _turn = self.queue.lock().await;
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(METADATA_SUFFIX)) {
                if !id.is_empty() {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// When the metadata file of `id` was last rewritten.
    pub async fn last_written(&self, id: &str) -> Option<SystemTime> {
        let _turn = self.queue.lock().await;
        let path = self.path_for(id, StoredFile::Metadata).ok()?;
        tokio::fs::metadata(&path).await.ok()?.modified().ok()
    }

    // -- Queue-held internals ----------------------------------------------

    async fn read_reconciled(&self, id: &str) -> Option<UploadRecord> {
        let path = self.path_for(id, StoredFile::Metadata).ok()?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(id = %id, error = %e, "failed to read upload metadata");
                }
                return None;
            }
        };
        let mut record: UploadRecord = match serde_json::from_slice(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(id = %id, error = %e, "unparsable upload metadata treated as missing");
                return None;
            }
        };
        record.id = id.to_string();

        if record.size != Some(record.offset) {
            let durable = self.payload_len(id).await;
            if durable != record.offset {
                debug!(
                    id = %id,
                    stored = record.offset,
                    durable,
                    "reconciling upload offset with payload size"
                );
                record.offset = durable;
                if let Err(e) = self.write_record(id, &record).await {
                    warn!(id = %id, error = %e, "failed to persist reconciled offset");
                }
            }
        }

        Some(record.with_runtime(&self.root))
    }

    async fn payload_len(&self, id: &str) -> u64 {
        let Ok(path) = self.path_for(id, StoredFile::Payload) else {
            return 0;
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        }
    }

    /// Crash-only write: temp file, fsync, rename.
    async fn write_record(&self, id: &str, record: &UploadRecord) -> anyhow::Result<()> {
        let final_path = self.path_for(id, StoredFile::Metadata)?;
        let mut clean = record.persistable();
        clean.id = id.to_string();
        let json = serde_json::to_vec(&clean)?;

        let tmp_path = self
            .root
            .join(TMP_DIR)
            .join(format!("meta-{}", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    async fn remove_file(&self, id: &str, file: StoredFile) {
        let path = match self.path_for(id, file) {
            Ok(path) => path,
            Err(e) => {
                warn!(id = %id, error = %e, "refusing to delete outside the store");
                return;
            }
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(id = %id, ?file, "deleted upload file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(id = %id, ?file, "upload file already absent");
            }
            Err(e) => warn!(id = %id, ?file, error = %e, "failed to delete upload file"),
        }
    }
}
