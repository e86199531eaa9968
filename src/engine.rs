//! Upload protocol engine.
//!
//! Implements the resumable-upload state machine on top of the
//! [`MetadataStore`] and a [`ChunkDatastore`]:
//!
//! ```text
//! Created -> (Patched)* -> Finished
//!     \________\______________\____> Deleted
//! ```
//!
//! Requests for the same upload id are serialized by a per-upload FIFO
//! lease, taken before the first metadata read and held until the record
//! has been rewritten after the append. The finish hook always sees a
//! record re-read (and therefore reconciled) through the store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::http::StatusCode;
use metrics::counter;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::errors::UploadError;
use crate::hooks::{CreateDecision, FinishReply, HookContext, UploadHooks};
use crate::metadata::record::UploadRecord;
use crate::metadata::store::{MetadataStore, StoredFile};
use crate::metrics::{
    BYTES_RECEIVED_TOTAL, FINISH_ROLLBACKS_TOTAL, UPLOADS_CREATED_TOTAL, UPLOADS_FINISHED_TOTAL,
};
use crate::storage::backend::{BoxedReader, ChunkDatastore};

/// Lock-table size above which idle slots are pruned.
const LOCK_PRUNE_THRESHOLD: usize = 256;

/// Engine tunables.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Largest accepted upload in bytes; 0 means unlimited.
    pub max_size: u64,
    /// Lifetime of an idle incomplete upload; `None` disables expiry.
    pub expiry_ttl: Option<Duration>,
}

/// A chunk body on its way to disk.
pub struct Chunk {
    pub reader: BoxedReader,
    /// `Content-Length` of the request, when the client sent one.
    pub content_length: Option<u64>,
}

/// A create request after header parsing and naming.
pub struct CreateRequest {
    pub id: String,
    /// `None` when the length is deferred.
    pub size: Option<u64>,
    pub metadata: BTreeMap<String, String>,
    /// Initial chunk for creation-with-upload.
    pub chunk: Option<Chunk>,
}

/// An append request.
pub struct PatchRequest {
    pub id: String,
    pub offset: u64,
    /// `Upload-Length` sent with the chunk (fixes a deferred length).
    pub upload_length: Option<u64>,
    pub chunk: Chunk,
}

/// What the HTTP adapter needs to answer a create/patch/replay.
#[derive(Debug, Clone)]
pub struct UploadReply {
    pub status: StatusCode,
    pub record: UploadRecord,
    /// JSON body produced by the finish hook.
    pub body: Option<serde_json::Value>,
    /// Whether the server already had this file before the request.
    pub file_existed: bool,
    /// When the upload expires, for incomplete uploads.
    pub expires: Option<SystemTime>,
}

/// Exclusive access to one upload id.
pub(crate) type UploadLease = OwnedMutexGuard<()>;

#[derive(Default)]
struct UploadLocks {
    slots: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UploadLocks {
    async fn acquire(&self, id: &str) -> UploadLease {
        let slot = {
            let mut slots = self.slots.lock().expect("upload lock table poisoned");
            if slots.len() > LOCK_PRUNE_THRESHOLD {
                // A slot nobody holds or waits on is only referenced by the table.
                slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            slots.entry(id.to_string()).or_default().clone()
        };
        slot.lock_owned().await
    }
}

/// The resumable-upload protocol engine.
pub struct UploadEngine {
    datastore: Arc<dyn ChunkDatastore>,
    metadata: Arc<MetadataStore>,
    hooks: Arc<dyn UploadHooks>,
    options: EngineOptions,
    locks: UploadLocks,
}

impl UploadEngine {
    pub fn new(
        datastore: Arc<dyn ChunkDatastore>,
        metadata: Arc<MetadataStore>,
        hooks: Arc<dyn UploadHooks>,
        options: EngineOptions,
    ) -> Self {
        Self {
            datastore,
            metadata,
            hooks,
            options,
            locks: UploadLocks::default(),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub(crate) fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub(crate) fn datastore(&self) -> &dyn ChunkDatastore {
        self.datastore.as_ref()
    }

    pub(crate) async fn lease(&self, id: &str) -> UploadLease {
        self.locks.acquire(id).await
    }

    // -- Operations --------------------------------------------------------

    /// Create a new upload, optionally with its first chunk.
    ///
    /// An upload declared with size 0 is finished immediately.
    pub async fn create(
        &self,
        ctx: &HookContext,
        req: CreateRequest,
    ) -> Result<UploadReply, UploadError> {
        let CreateRequest {
            id,
            size,
            metadata,
            chunk,
        } = req;

        // Fatal precondition: nothing is touched for an escaping name.
        self.datastore.resolve(&id)?;
        self.check_max_size(size)?;
        if let (Some(size), Some(length)) = (size, chunk.as_ref().and_then(|c| c.content_length)) {
            if length > size {
                return Err(UploadError::SizeExceeded {
                    message: format!("chunk of {length} bytes exceeds Upload-Length {size}"),
                });
            }
        }

        let _lease = self.lease(&id).await;

        let proposed = UploadRecord::new(id.clone(), size, metadata);
        let mut record = match self.hooks.on_upload_create(ctx, proposed).await? {
            CreateDecision::Accept(record) => record,
            CreateDecision::Veto(reason) => {
                info!(id = %id, reason = %reason, "upload creation vetoed");
                return Err(UploadError::Vetoed { reason });
            }
        };
        record.id = id.clone();
        record.size = size;
        record.offset = 0;

        self.datastore.create(&id).await?;
        self.metadata.set(&id, &record).await?;
        counter!(UPLOADS_CREATED_TOTAL).increment(1);
        info!(id = %id, size = ?size, "upload created");

        let record = match chunk {
            Some(chunk) => self.append(&id, record, chunk).await?,
            None => self.reread(&id).await?,
        };

        if record.is_complete() {
            let existed = record.size == Some(0);
            return self.finish(ctx, record, StatusCode::CREATED, existed).await;
        }

        let expires = self.expires_at(&record).await;
        Ok(UploadReply {
            status: StatusCode::CREATED,
            record,
            body: None,
            file_existed: false,
            expires,
        })
    }

    /// Current reconciled state of an upload.
    pub async fn head(&self, id: &str) -> Result<UploadRecord, UploadError> {
        self.datastore.resolve(id)?;
        let record = self.reread(id).await?;
        if self.is_expired(&record, SystemTime::now()).await {
            return Err(UploadError::Gone { id: id.to_string() });
        }
        Ok(record)
    }

    /// Append a chunk at the declared offset.
    pub async fn patch(
        &self,
        ctx: &HookContext,
        req: PatchRequest,
    ) -> Result<UploadReply, UploadError> {
        let PatchRequest {
            id,
            offset,
            upload_length,
            chunk,
        } = req;

        self.datastore.resolve(&id)?;
        let _lease = self.lease(&id).await;

        let mut record = self.reread(&id).await?;
        if self.is_expired(&record, SystemTime::now()).await {
            return Err(UploadError::Gone { id });
        }

        let length_fixed_now = record.size.is_none() && upload_length.is_some();
        match (record.size, upload_length) {
            (None, Some(length)) => {
                if length < record.offset {
                    return Err(UploadError::InvalidHeader {
                        message: format!(
                            "Upload-Length {length} is below the current offset {}",
                            record.offset
                        ),
                    });
                }
                self.check_max_size(Some(length))?;
                record.size = Some(length);
            }
            (Some(size), Some(length)) if size != length => {
                return Err(UploadError::InvalidHeader {
                    message: "Upload-Length cannot be changed once set".to_string(),
                });
            }
            _ => {}
        }

        if offset != record.offset {
            return Err(UploadError::OffsetMismatch {
                expected: record.offset,
                received: offset,
            });
        }

        // A length fixed by this request still goes through append, which
        // persists it, and then through finish.
        if record.is_complete() && !length_fixed_now {
            debug!(id = %id, "patch on an already complete upload");
            return Ok(UploadReply {
                status: StatusCode::NO_CONTENT,
                record,
                body: None,
                file_existed: true,
                expires: None,
            });
        }

        let record = self.append(&id, record, chunk).await?;
        if record.is_complete() {
            return self.finish(ctx, record, StatusCode::NO_CONTENT, false).await;
        }

        let expires = self.expires_at(&record).await;
        Ok(UploadReply {
            status: StatusCode::NO_CONTENT,
            record,
            body: None,
            file_existed: false,
            expires,
        })
    }

    /// Remove an upload's metadata and payload. Absent uploads are a no-op.
    pub async fn delete(&self, id: &str) -> Result<(), UploadError> {
        self.datastore.resolve(id)?;
        let _lease = self.lease(id).await;
        self.metadata.delete_all(id).await;
        info!(id = %id, "upload deleted");
        Ok(())
    }

    /// Open a completed upload for reading.
    pub async fn open(&self, id: &str) -> Result<(UploadRecord, BoxedReader), UploadError> {
        let record = self.head(id).await?;
        if !record.is_complete() || self.datastore.file_size(id).await?.is_none() {
            return Err(UploadError::NotFound { id: id.to_string() });
        }
        let reader = self.datastore.open(id).await?;
        Ok((record, reader))
    }

    /// Delete `id` if it is incomplete and past its expiry at `now`.
    pub async fn reap_if_expired(&self, id: &str, now: SystemTime) -> Result<bool, UploadError> {
        self.datastore.resolve(id)?;
        let _lease = self.lease(id).await;
        let Some(record) = self.metadata.get(id).await else {
            return Ok(false);
        };
        if !self.is_expired(&record, now).await {
            return Ok(false);
        }
        self.metadata.delete_all(id).await;
        info!(id = %id, offset = record.offset, size = ?record.size, "expired upload removed");
        Ok(true)
    }

    // -- Transitions -------------------------------------------------------

    /// Stream a chunk to disk, persist the new offset, and return the record
    /// as re-read through the store. Caller holds the lease.
    async fn append(
        &self,
        id: &str,
        mut record: UploadRecord,
        chunk: Chunk,
    ) -> Result<UploadRecord, UploadError> {
        let remaining = record.remaining();
        if let (Some(remaining), Some(length)) = (remaining, chunk.content_length) {
            if length > remaining {
                return Err(UploadError::SizeExceeded {
                    message: format!("chunk of {length} bytes exceeds the {remaining} bytes remaining"),
                });
            }
        }
        let limit = remaining.or_else(|| {
            (self.options.max_size > 0)
                .then(|| self.options.max_size.saturating_sub(record.offset))
        });

        let written = match self
            .datastore
            .write(id, record.offset, chunk.reader, limit)
            .await
        {
            Ok(written) => written,
            Err(e) => {
                // Bytes that reached the disk are picked up by reconciliation.
                let _ = self.metadata.get(id).await;
                warn!(id = %id, error = %e, "chunk write interrupted");
                return Err(e.into());
            }
        };

        record.offset += written;
        counter!(BYTES_RECEIVED_TOTAL).increment(written);
        self.metadata.set(id, &record).await?;
        debug!(id = %id, offset = record.offset, written, "chunk persisted");

        self.reread(id).await
    }

    /// Run the finish hook on a completed record. On hook failure the
    /// payload and metadata are removed before the error is returned.
    pub(crate) async fn finish(
        &self,
        ctx: &HookContext,
        record: UploadRecord,
        status: StatusCode,
        file_existed: bool,
    ) -> Result<UploadReply, UploadError> {
        match self.hooks.on_upload_finish(ctx, &record).await {
            Ok(reply) => {
                counter!(UPLOADS_FINISHED_TOTAL).increment(1);
                info!(id = %record.id, size = ?record.size, file_existed, "upload finished");
                let (status, body) = match reply {
                    FinishReply::Json(body) => (StatusCode::OK, Some(body)),
                    FinishReply::Continue => (status, None),
                };
                Ok(UploadReply {
                    status,
                    record,
                    body,
                    file_existed,
                    expires: None,
                })
            }
            Err(e) => {
                warn!(id = %record.id, error = %e, "finish hook failed; rolling back upload");
                if let Err(remove_err) = self.datastore.remove(&record.id).await {
                    warn!(id = %record.id, error = %remove_err, "failed to remove payload during rollback");
                }
                self.metadata.delete(&record.id, StoredFile::Metadata).await;
                counter!(FINISH_ROLLBACKS_TOTAL).increment(1);
                Err(UploadError::FinishRolledBack(e))
            }
        }
    }

    // -- Helpers -----------------------------------------------------------

    async fn reread(&self, id: &str) -> Result<UploadRecord, UploadError> {
        self.metadata
            .get(id)
            .await
            .ok_or_else(|| UploadError::NotFound { id: id.to_string() })
    }

    fn check_max_size(&self, size: Option<u64>) -> Result<(), UploadError> {
        match size {
            Some(size) if self.options.max_size > 0 && size > self.options.max_size => {
                Err(UploadError::SizeExceeded {
                    message: format!(
                        "Upload-Length {size} exceeds the maximum of {}",
                        self.options.max_size
                    ),
                })
            }
            _ => Ok(()),
        }
    }

    /// Later of creation and last metadata write, plus the TTL.
    pub async fn expires_at(&self, record: &UploadRecord) -> Option<SystemTime> {
        let ttl = self.options.expiry_ttl?;
        if record.is_complete() {
            return None;
        }
        let created = SystemTime::from(record.creation_date);
        let last_active = match self.metadata.last_written(&record.id).await {
            Some(written) if written > created => written,
            _ => created,
        };
        Some(last_active + ttl)
    }

    async fn is_expired(&self, record: &UploadRecord, now: SystemTime) -> bool {
        self.expires_at(record)
            .await
            .is_some_and(|expires| expires <= now)
    }
}
