//! The upload metadata record and its derived runtime view.
//!
//! An [`UploadRecord`] is what lives in `{id}.json` next to the payload.
//! [`RuntimeInfo`] is recomputed from the record on every read and is
//! never serialized.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key reserved for derived data. Stripped from caller metadata on write.
pub const RUNTIME_KEY: &str = "runtime";

/// Fallback content type when nothing better is known.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Metadata keys that may carry the original file name, in priority order.
const NAME_KEYS: &[&str] = &["filename", "name", "originalname"];

/// Metadata keys that may carry the content type, in priority order.
const TYPE_KEYS: &[&str] = &["filetype", "type", "mimetype", "contentType"];

/// Persisted description of one upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    /// Stable identifier; also the payload file name.
    pub id: String,
    /// Total expected length. `None` while the length is deferred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Bytes durably written so far.
    #[serde(default)]
    pub offset: u64,
    /// Caller-supplied key/value pairs (keys are case-sensitive).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Set once at creation, never mutated.
    pub creation_date: DateTime<Utc>,
    /// Derived view, recomputed on read.
    #[serde(skip)]
    pub runtime: Option<RuntimeInfo>,
}

/// Derived, never-persisted facts about an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInfo {
    /// Absolute path of the payload file.
    pub path: PathBuf,
    /// On-disk (hash-based) file name.
    pub storage_name: String,
    /// Name the file had on the client.
    pub original_name: String,
    /// Content type from metadata or guessed from the extension.
    pub content_type: String,
}

impl UploadRecord {
    /// A freshly created record at offset 0.
    pub fn new(id: impl Into<String>, size: Option<u64>, metadata: BTreeMap<String, String>) -> Self {
        Self {
            id: id.into(),
            size,
            offset: 0,
            metadata,
            creation_date: Utc::now(),
            runtime: None,
        }
    }

    /// `true` once every declared byte is durable.
    pub fn is_complete(&self) -> bool {
        self.size.is_some_and(|size| self.offset >= size)
    }

    /// Bytes still expected, if the length is known.
    pub fn remaining(&self) -> Option<u64> {
        self.size.map(|size| size.saturating_sub(self.offset))
    }

    /// Name the client used for this file, falling back to the id.
    pub fn original_name(&self) -> String {
        NAME_KEYS
            .iter()
            .find_map(|k| self.metadata.get(*k).filter(|v| !v.is_empty()))
            .cloned()
            .unwrap_or_else(|| self.id.clone())
    }

    /// Declared content type, else a guess from the file extension.
    pub fn content_type(&self) -> String {
        TYPE_KEYS
            .iter()
            .find_map(|k| self.metadata.get(*k).filter(|v| !v.is_empty()))
            .cloned()
            .unwrap_or_else(|| guess_content_type(&self.original_name()).to_string())
    }

    /// Attach a freshly computed [`RuntimeInfo`] for a payload under `root`.
    pub fn with_runtime(mut self, root: &Path) -> Self {
        self.runtime = Some(RuntimeInfo {
            path: root.join(&self.id),
            storage_name: self.id.clone(),
            original_name: self.original_name(),
            content_type: self.content_type(),
        });
        self
    }

    /// Copy of the record with every derived field removed.
    pub fn persistable(&self) -> Self {
        let mut clean = self.clone();
        clean.runtime = None;
        clean.metadata.remove(RUNTIME_KEY);
        clean
    }

    /// Overwrite metadata entries with `incoming`, dropping the reserved key.
    pub fn merge_metadata(&mut self, incoming: BTreeMap<String, String>) {
        for (key, value) in incoming {
            if key != RUNTIME_KEY {
                self.metadata.insert(key, value);
            }
        }
    }
}

/// Best-effort content type from a file name's extension.
pub fn guess_content_type(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return DEFAULT_CONTENT_TYPE,
    };
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "avif" => "image/avif",
        "bmp" => "image/bmp",
        "ico" => "image/x-icon",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "zip" => "application/zip",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        _ => DEFAULT_CONTENT_TYPE,
    }
}
