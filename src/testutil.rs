//! Shared test fixtures: lifecycle hooks that record their calls, and an
//! engine over a temporary directory.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::http::{HeaderMap, Method, StatusCode};

use crate::engine::{Chunk, EngineOptions, UploadEngine};
use crate::hooks::{
    CreateDecision, FinishReply, HookContext, HookError, HookFuture, UploadHooks,
};
use crate::metadata::record::UploadRecord;
use crate::metadata::store::MetadataStore;
use crate::storage::local::LocalDatastore;

/// Hooks that count calls and can be told to fail.
#[derive(Default)]
pub struct RecordingHooks {
    creates: AtomicUsize,
    finished: Mutex<Vec<UploadRecord>>,
    fail_finish: bool,
    veto: Option<String>,
    continue_reply: bool,
}

impl RecordingHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_finish() -> Arc<Self> {
        Arc::new(Self {
            fail_finish: true,
            ..Self::default()
        })
    }

    pub fn vetoing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            veto: Some(reason.to_string()),
            ..Self::default()
        })
    }

    /// Finish replies with `Continue` instead of a JSON body.
    pub fn continuing() -> Arc<Self> {
        Arc::new(Self {
            continue_reply: true,
            ..Self::default()
        })
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn finish_count(&self) -> usize {
        self.finished.lock().unwrap().len()
    }

    pub fn finished(&self) -> Vec<UploadRecord> {
        self.finished.lock().unwrap().clone()
    }
}

impl UploadHooks for RecordingHooks {
    fn on_upload_create<'a>(
        &'a self,
        _ctx: &'a HookContext,
        record: UploadRecord,
    ) -> HookFuture<'a, CreateDecision> {
        Box::pin(async move {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(match &self.veto {
                Some(reason) => CreateDecision::Veto(reason.clone()),
                None => CreateDecision::Accept(record),
            })
        })
    }

    fn on_upload_finish<'a>(
        &'a self,
        _ctx: &'a HookContext,
        record: &'a UploadRecord,
    ) -> HookFuture<'a, FinishReply> {
        Box::pin(async move {
            self.finished.lock().unwrap().push(record.clone());
            if self.fail_finish {
                return Err(HookError::new(StatusCode::BAD_GATEWAY, "catalog unavailable"));
            }
            if self.continue_reply {
                return Ok(FinishReply::Continue);
            }
            Ok(FinishReply::Json(serde_json::json!({
                "id": record.id,
                "size": record.offset,
            })))
        })
    }
}

/// Engine over a fresh temp directory with no size limit and no expiry.
pub fn test_engine(hooks: Arc<RecordingHooks>) -> (tempfile::TempDir, UploadEngine) {
    test_engine_with(hooks, EngineOptions::default())
}

pub fn test_engine_with(
    hooks: Arc<RecordingHooks>,
    options: EngineOptions,
) -> (tempfile::TempDir, UploadEngine) {
    let dir = tempfile::TempDir::new().unwrap();
    let datastore = LocalDatastore::new(dir.path()).unwrap();
    let metadata = MetadataStore::new(dir.path()).unwrap();
    let engine = UploadEngine::new(Arc::new(datastore), Arc::new(metadata), hooks, options);
    (dir, engine)
}

pub fn chunk(data: &'static [u8]) -> Chunk {
    Chunk {
        reader: Box::pin(data),
        content_length: Some(data.len() as u64),
    }
}

pub fn ctx() -> HookContext {
    HookContext::new(Method::PATCH, HeaderMap::new(), BTreeMap::new())
}
