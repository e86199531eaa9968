//! Pre-flight existence guard.
//!
//! Before a create or append reaches the engine, check whether the target
//! payload is already complete on disk (its length equals the recorded
//! size). If so, the request is answered as a completed upload: caller
//! metadata is merged into the record, the finish hook is replayed and its
//! reply returned. A client retrying an upload the server already holds
//! gets the same response and side effects as the original completion.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use metrics::counter;
use tracing::{debug, info};

use crate::engine::{UploadEngine, UploadReply};
use crate::errors::UploadError;
use crate::hooks::HookContext;
use crate::metrics::GUARD_HITS_TOTAL;
use crate::protocol::{declared_file_name, request_metadata};
use crate::server::{hook_context, reply_response};
use crate::AppState;

/// Replay the completion of `id` if its payload is already whole.
///
/// Returns `Ok(None)` when there is nothing to short-circuit: no payload,
/// no metadata record, or a payload whose length differs from the
/// recorded size.
pub async fn check_existing(
    engine: &UploadEngine,
    ctx: &HookContext,
    id: &str,
    incoming: BTreeMap<String, String>,
    status: StatusCode,
) -> Result<Option<UploadReply>, UploadError> {
    engine.datastore().resolve(id)?;
    let _lease = engine.lease(id).await;

    let Some(on_disk) = engine.datastore().file_size(id).await? else {
        return Ok(None);
    };
    let Some(mut record) = engine.metadata().get(id).await else {
        return Ok(None);
    };
    if record.size != Some(on_disk) {
        debug!(id = %id, on_disk, size = ?record.size, "existing payload does not match record");
        return Ok(None);
    }

    record.merge_metadata(incoming);
    record.offset = on_disk;
    engine.metadata().set(id, &record).await?;
    // Removed between the stat and the re-read: proceed as a fresh upload.
    let Some(record) = engine.metadata().get(id).await else {
        return Ok(None);
    };

    counter!(GUARD_HITS_TOTAL).increment(1);
    info!(id = %id, size = on_disk, "upload already complete; replaying finish");
    engine.finish(ctx, record, status, true).await.map(Some)
}

/// Middleware on the create and append routes.
///
/// POST is only checked when the caller declared a file name; a random
/// name can never match an existing file.
pub async fn existence_guard(
    State(state): State<Arc<AppState>>,
    id: Option<Path<String>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, UploadError> {
    let method = req.method().clone();
    let target = match (method, id) {
        (Method::POST, _) => declared_file_name(req.headers()).map(|name| (name, StatusCode::OK)),
        (Method::PATCH, Some(Path(id))) => Some((id, StatusCode::NO_CONTENT)),
        _ => None,
    };
    let Some((id, status)) = target else {
        return Ok(next.run(req).await);
    };

    let incoming = request_metadata(req.headers())?;
    let ctx = hook_context(req.method(), req.uri(), req.headers());
    match check_existing(&state.engine, &ctx, &id, incoming, status).await? {
        Some(reply) => Ok(reply_response(&state.config, req.headers(), reply)),
        None => Ok(next.run(req).await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CreateRequest, PatchRequest};
    use crate::testutil::{chunk, ctx, test_engine, RecordingHooks};

    async fn complete_upload(engine: &UploadEngine, id: &str, data: &'static [u8]) {
        let mut meta = BTreeMap::new();
        meta.insert("filename".to_string(), "old.png".to_string());
        meta.insert("album".to_string(), "trip".to_string());
        engine
            .create(
                &ctx(),
                CreateRequest {
                    id: id.to_string(),
                    size: Some(data.len() as u64),
                    metadata: meta,
                    chunk: None,
                },
            )
            .await
            .unwrap();
        engine
            .patch(
                &ctx(),
                PatchRequest {
                    id: id.to_string(),
                    offset: 0,
                    upload_length: None,
                    chunk: chunk(data),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_existing_upload_replays_finish_with_merged_metadata() {
        let hooks = RecordingHooks::new();
        let (dir, engine) = test_engine(hooks.clone());
        complete_upload(&engine, "photo.png", b"pixels").await;
        assert_eq!(hooks.finish_count(), 1);

        let mut incoming = BTreeMap::new();
        incoming.insert("filename".to_string(), "new.png".to_string());
        let reply = check_existing(&engine, &ctx(), "photo.png", incoming, StatusCode::OK)
            .await
            .unwrap()
            .expect("guard should match");

        assert_eq!(reply.status, StatusCode::OK);
        assert!(reply.file_existed);
        assert_eq!(reply.record.offset, 6);
        assert_eq!(reply.record.size, Some(6));
        assert_eq!(hooks.finish_count(), 2);

        let replayed = hooks.finished().pop().unwrap();
        assert_eq!(replayed.metadata["filename"], "new.png");
        assert_eq!(replayed.metadata["album"], "trip");

        let stored = std::fs::read_to_string(dir.path().join("photo.png.json")).unwrap();
        assert!(stored.contains("new.png"));
        assert_eq!(std::fs::read(dir.path().join("photo.png")).unwrap(), b"pixels");
    }

    #[tokio::test]
    async fn test_size_mismatch_falls_through() {
        let hooks = RecordingHooks::new();
        let (_dir, engine) = test_engine(hooks.clone());
        engine
            .create(
                &ctx(),
                CreateRequest {
                    id: "partial.bin".to_string(),
                    size: Some(10),
                    metadata: BTreeMap::new(),
                    chunk: Some(chunk(b"abc")),
                },
            )
            .await
            .unwrap();

        let reply = check_existing(&engine, &ctx(), "partial.bin", BTreeMap::new(), StatusCode::OK)
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(hooks.finish_count(), 0);
    }

    #[tokio::test]
    async fn test_payload_without_metadata_falls_through() {
        let hooks = RecordingHooks::new();
        let (dir, engine) = test_engine(hooks.clone());
        std::fs::write(dir.path().join("orphan.bin"), b"data").unwrap();

        let reply = check_existing(&engine, &ctx(), "orphan.bin", BTreeMap::new(), StatusCode::OK)
            .await
            .unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_unknown_upload_falls_through() {
        let (_dir, engine) = test_engine(RecordingHooks::new());
        let reply = check_existing(&engine, &ctx(), "nothing", BTreeMap::new(), StatusCode::OK)
            .await
            .unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_escaping_name_is_rejected() {
        let (_dir, engine) = test_engine(RecordingHooks::new());
        let result =
            check_existing(&engine, &ctx(), "../../etc/passwd", BTreeMap::new(), StatusCode::OK).await;
        assert!(matches!(result, Err(UploadError::PathTraversal(_))));
    }
}
