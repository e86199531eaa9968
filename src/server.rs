//! Axum router construction and upload route mapping.
//!
//! The [`app`] function wires the resumable-upload endpoints, the
//! existence guard and the infrastructure routes into a ready-to-serve
//! [`axum::Router`]. Handlers only translate headers into engine calls and
//! engine replies back into protocol headers; all state transitions live
//! in [`crate::engine`].

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::TryStreamExt;
use std::sync::Arc;
use tokio_util::io::{ReaderStream, StreamReader};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::config::Config;
use crate::engine::{Chunk, CreateRequest, PatchRequest, UploadReply};
use crate::errors::{generate_request_id, UploadError};
use crate::guard::existence_guard;
use crate::hooks::HookContext;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::protocol::*;
use crate::AppState;

// -- OpenAPI document ---------------------------------------------------------

/// OpenAPI documentation for the upload API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Chunkyard Resumable Upload API",
        version = "0.1.0",
        description = "tus 1.0.0 resumable upload server"
    ),
    paths(
        health_check,
        options_upload,
        create_upload,
        head_upload,
        patch_upload,
        delete_upload,
        get_upload,
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Upload", description = "Resumable upload protocol"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with all upload routes.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    let base = state.config.upload.base_path.trim_end_matches('/').to_string();
    let collection = if base.is_empty() { "/".to_string() } else { base.clone() };
    let item = format!("{base}/:id");

    // The guard sits after routing so it can see the `:id` path parameter.
    let uploads = Router::new()
        .route(&collection, post(create_upload).options(options_upload))
        .route(
            &item,
            get(get_upload)
                .head(head_upload)
                .patch(patch_upload)
                .delete(delete_upload)
                .options(options_upload),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            existence_guard,
        ));

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/openapi.json", get(openapi_json));
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    let exposed: Vec<HeaderName> = EXPOSED_HEADERS
        .iter()
        .map(|h| HeaderName::from_static(h))
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(exposed);

    router
        .merge(uploads)
        .with_state(state)
        // Innermost: protocol version check runs before the guard.
        .layer(middleware::from_fn(tus_version_middleware))
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        // metrics_middleware is outer (captures full request lifecycle).
        .layer(middleware::from_fn_with_state(
            Arc::<str>::from(base.as_str()),
            metrics_middleware,
        ))
        // Chunks are streamed to disk; no in-memory body limit.
        .layer(DefaultBodyLimit::disable())
}

// -- Middleware ---------------------------------------------------------------

/// Adds `Tus-Resumable`, `x-request-id`, `Date` and `Server` to every
/// response, and echoes the client's `x-uploader-file-id`.
async fn common_headers_middleware(req: Request<Body>, next: Next) -> Response {
    let file_id = req.headers().get(H_FILE_ID).cloned();
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(H_TUS_RESUMABLE, HeaderValue::from_static(TUS_RESUMABLE));
    if !headers.contains_key("x-request-id") {
        if let Ok(id) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", id);
        }
    }
    if let Some(file_id) = file_id {
        headers.insert(H_FILE_ID, file_id);
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(date) = HeaderValue::from_str(&date) {
        headers.insert(header::DATE, date);
    }
    headers.insert(header::SERVER, HeaderValue::from_static("Chunkyard"));

    response
}

/// Rejects requests that do not speak our protocol version. `OPTIONS` and
/// `GET` are exempt.
async fn tus_version_middleware(req: Request<Body>, next: Next) -> Result<Response, UploadError> {
    let exempt = matches!(*req.method(), Method::OPTIONS | Method::GET);
    if !exempt && header_str(req.headers(), H_TUS_RESUMABLE) != Some(TUS_RESUMABLE) {
        return Err(UploadError::UnsupportedVersion);
    }
    Ok(next.run(req).await)
}

// -- Shared helpers -----------------------------------------------------------

/// Hook context for a request: method, headers and the merged query.
pub(crate) fn hook_context(method: &Method, uri: &Uri, headers: &HeaderMap) -> HookContext {
    HookContext::new(
        method.clone(),
        headers.clone(),
        merged_query(uri.query(), headers),
    )
}

/// Serialize an engine reply into protocol headers plus an optional JSON
/// body from the finish hook.
pub(crate) fn reply_response(config: &Config, headers: &HeaderMap, reply: UploadReply) -> Response {
    let mut response = match reply.body {
        Some(body) => (reply.status, Json(body)).into_response(),
        None => reply.status.into_response(),
    };
    let out = response.headers_mut();

    let location = location(
        headers,
        config.upload.public_base_url.as_deref(),
        &config.upload.base_path,
        &reply.record.id,
    );
    if let Ok(location) = HeaderValue::from_str(&location) {
        out.insert(header::LOCATION, location);
    }
    out.insert(H_UPLOAD_OFFSET, HeaderValue::from(reply.record.offset));
    if let Some(size) = reply.record.size {
        out.insert(H_UPLOAD_LENGTH, HeaderValue::from(size));
    }
    if let Some(expires) = reply.expires {
        if let Ok(expires) = HeaderValue::from_str(&httpdate::fmt_http_date(expires)) {
            out.insert(H_UPLOAD_EXPIRES, expires);
        }
    }
    out.insert(
        H_FILE_EXIST,
        HeaderValue::from_static(if reply.file_existed { "true" } else { "false" }),
    );
    response
}

/// Wrap a request body as a streamed chunk.
fn body_chunk(body: Body, headers: &HeaderMap) -> Result<Chunk, UploadError> {
    let content_length = parse_u64_header(headers, header::CONTENT_LENGTH.as_str())?;
    let stream = TryStreamExt::map_err(body.into_data_stream(), std::io::Error::other);
    Ok(Chunk {
        reader: Box::pin(StreamReader::new(stream)),
        content_length,
    })
}

// -- Infrastructure -----------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// `GET /openapi.json`
async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

// -- Upload handlers ----------------------------------------------------------

/// `OPTIONS /files[/{id}]` -- advertise protocol capabilities.
#[utoipa::path(
    options,
    path = "/files",
    tag = "Upload",
    operation_id = "Options",
    responses(
        (status = 204, description = "Protocol capabilities in Tus-* headers")
    )
)]
async fn options_upload(State(state): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(H_TUS_VERSION, HeaderValue::from_static(TUS_VERSION));
    headers.insert(H_TUS_EXTENSION, HeaderValue::from_static(TUS_EXTENSIONS));
    if state.config.upload.max_size > 0 {
        headers.insert(H_TUS_MAX_SIZE, HeaderValue::from(state.config.upload.max_size));
    }
    (StatusCode::NO_CONTENT, headers).into_response()
}

/// `POST /files` -- create an upload, optionally with its first chunk.
#[utoipa::path(
    post,
    path = "/files",
    tag = "Upload",
    operation_id = "CreateUpload",
    responses(
        (status = 201, description = "Upload created"),
        (status = 200, description = "Upload already complete; finish result in body"),
        (status = 400, description = "Missing Upload-Length"),
        (status = 403, description = "Rejected name or vetoed"),
        (status = 413, description = "Upload-Length above the server maximum")
    )
)]
async fn create_upload(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, UploadError> {
    let size = match (
        parse_u64_header(&headers, H_UPLOAD_LENGTH)?,
        defers_length(&headers)?,
    ) {
        (Some(size), false) => Some(size),
        (None, true) => None,
        (Some(_), true) => {
            return Err(UploadError::InvalidHeader {
                message: "Upload-Length and Upload-Defer-Length are mutually exclusive"
                    .to_string(),
            })
        }
        (None, false) => {
            return Err(UploadError::InvalidHeader {
                message: "Upload-Length or Upload-Defer-Length is required".to_string(),
            })
        }
    };

    let metadata = request_metadata(&headers)?;
    let id = file_name_for_create(&headers);
    let chunk = if is_chunk_body(&headers) {
        Some(body_chunk(body, &headers)?)
    } else {
        None
    };

    let ctx = hook_context(&method, &uri, &headers);
    let reply = state
        .engine
        .create(
            &ctx,
            CreateRequest {
                id,
                size,
                metadata,
                chunk,
            },
        )
        .await?;
    Ok(reply_response(&state.config, &headers, reply))
}

/// `HEAD /files/{id}` -- current offset and declared length.
#[utoipa::path(
    head,
    path = "/files/{id}",
    tag = "Upload",
    operation_id = "HeadUpload",
    params(("id" = String, Path, description = "Upload id")),
    responses(
        (status = 200, description = "Upload-Offset and Upload-Length headers"),
        (status = 404, description = "Unknown upload"),
        (status = 410, description = "Upload expired")
    )
)]
async fn head_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, UploadError> {
    let record = state.engine.head(&id).await?;

    let mut response = StatusCode::OK.into_response();
    let out = response.headers_mut();
    out.insert(H_UPLOAD_OFFSET, HeaderValue::from(record.offset));
    match record.size {
        Some(size) => out.insert(H_UPLOAD_LENGTH, HeaderValue::from(size)),
        None => out.insert(H_UPLOAD_DEFER_LENGTH, HeaderValue::from_static("1")),
    };
    if !record.metadata.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&encode_upload_metadata(&record.metadata)) {
            out.insert(H_UPLOAD_METADATA, value);
        }
    }
    if let Some(expires) = state.engine.expires_at(&record).await {
        if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(expires)) {
            out.insert(H_UPLOAD_EXPIRES, value);
        }
    }
    out.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    out.insert(H_FILE_EXIST, HeaderValue::from_static("true"));
    Ok(response)
}

/// `PATCH /files/{id}` -- append a chunk at `Upload-Offset`.
#[utoipa::path(
    patch,
    path = "/files/{id}",
    tag = "Upload",
    operation_id = "PatchUpload",
    params(("id" = String, Path, description = "Upload id")),
    responses(
        (status = 204, description = "Chunk accepted"),
        (status = 200, description = "Upload finished; finish result in body"),
        (status = 409, description = "Upload-Offset does not match"),
        (status = 410, description = "Upload expired"),
        (status = 415, description = "Wrong Content-Type")
    )
)]
async fn patch_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, UploadError> {
    if !is_chunk_body(&headers) {
        return Err(UploadError::UnsupportedMediaType);
    }
    let offset = parse_u64_header(&headers, H_UPLOAD_OFFSET)?.ok_or_else(|| {
        UploadError::InvalidHeader {
            message: "Upload-Offset is required".to_string(),
        }
    })?;
    let upload_length = parse_u64_header(&headers, H_UPLOAD_LENGTH)?;
    let chunk = body_chunk(body, &headers)?;

    let ctx = hook_context(&method, &uri, &headers);
    let reply = state
        .engine
        .patch(
            &ctx,
            PatchRequest {
                id,
                offset,
                upload_length,
                chunk,
            },
        )
        .await?;
    Ok(reply_response(&state.config, &headers, reply))
}

/// `DELETE /files/{id}` -- terminate an upload. Absent uploads are a no-op.
#[utoipa::path(
    delete,
    path = "/files/{id}",
    tag = "Upload",
    operation_id = "DeleteUpload",
    params(("id" = String, Path, description = "Upload id")),
    responses(
        (status = 204, description = "Upload removed")
    )
)]
async fn delete_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, UploadError> {
    state.engine.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `GET /files/{id}` -- stream a completed upload.
#[utoipa::path(
    get,
    path = "/files/{id}",
    tag = "Upload",
    operation_id = "GetUpload",
    params(("id" = String, Path, description = "Upload id")),
    responses(
        (status = 200, description = "Payload bytes"),
        (status = 404, description = "Unknown or incomplete upload")
    )
)]
async fn get_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, UploadError> {
    let (record, reader) = state.engine.open(&id).await?;

    let mut response = Body::from_stream(ReaderStream::new(reader)).into_response();
    let out = response.headers_mut();
    let content_type = HeaderValue::from_str(&record.content_type())
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    out.insert(header::CONTENT_TYPE, content_type);
    out.insert(header::CONTENT_LENGTH, HeaderValue::from(record.offset));
    Ok(response)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::UploadEngine;
    use crate::hooks::{DefaultHooks, UploadHooks};
    use crate::metadata::store::MetadataStore;
    use crate::storage::local::LocalDatastore;
    use crate::testutil::RecordingHooks;
    use tower::ServiceExt;

    fn setup_app(hooks: Arc<dyn UploadHooks>) -> (Router, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.upload.root_dir = tmp.path().to_string_lossy().into_owned();
        config.upload.max_size = 1024;

        let datastore = LocalDatastore::new(tmp.path()).unwrap();
        let metadata = MetadataStore::new(tmp.path()).unwrap();
        let engine = UploadEngine::new(
            Arc::new(datastore),
            Arc::new(metadata),
            hooks,
            config.engine_options(),
        );
        let state = Arc::new(AppState {
            config,
            engine: Arc::new(engine),
        });
        (app(state), tmp)
    }

    fn default_app() -> (Router, tempfile::TempDir) {
        setup_app(Arc::new(DefaultHooks::new(None, "/files")))
    }

    fn request(method: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(H_TUS_RESUMABLE, TUS_RESUMABLE)
    }

    fn create_request(name: &str, length: u64) -> Request<Body> {
        request("POST", "/files")
            .header(H_FILE_NAME, name)
            .header(H_UPLOAD_LENGTH, length.to_string())
            .body(Body::empty())
            .unwrap()
    }

    fn patch_request(id: &str, offset: u64, data: &'static [u8]) -> Request<Body> {
        request("PATCH", &format!("/files/{id}"))
            .header("content-type", OFFSET_OCTET_STREAM)
            .header(H_UPLOAD_OFFSET, offset.to_string())
            .header("content-length", data.len().to_string())
            .body(Body::from(data))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_options_advertises_capabilities() {
        let (app, _tmp) = default_app();
        let response = app
            .oneshot(Request::builder().method("OPTIONS").uri("/files").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[H_TUS_VERSION], TUS_VERSION);
        assert_eq!(response.headers()[H_TUS_EXTENSION], TUS_EXTENSIONS);
        assert_eq!(response.headers()[H_TUS_MAX_SIZE], "1024");
        assert_eq!(response.headers()[H_TUS_RESUMABLE], TUS_RESUMABLE);
    }

    #[tokio::test]
    async fn test_missing_version_header_is_rejected() {
        let (app, _tmp) = default_app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/files")
                    .header(H_UPLOAD_LENGTH, "3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(response.headers()[H_TUS_VERSION], TUS_VERSION);
    }

    #[tokio::test]
    async fn test_create_requires_length() {
        let (app, _tmp) = default_app();
        let response = app
            .oneshot(request("POST", "/files").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_over_max_size() {
        let (app, _tmp) = default_app();
        let response = app.oneshot(create_request("big.bin", 4096)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_full_upload_flow() {
        let (app, tmp) = default_app();

        let response = app.clone().oneshot(create_request("hello.txt", 11)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["location"], "/files/hello.txt");
        assert_eq!(response.headers()[H_UPLOAD_OFFSET], "0");
        assert_eq!(response.headers()[H_FILE_EXIST], "false");
        assert!(response.headers().contains_key(H_UPLOAD_EXPIRES));

        let response = app.clone().oneshot(patch_request("hello.txt", 0, b"hello ")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[H_UPLOAD_OFFSET], "6");

        let response = app
            .clone()
            .oneshot(request("HEAD", "/files/hello.txt").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[H_UPLOAD_OFFSET], "6");
        assert_eq!(response.headers()[H_UPLOAD_LENGTH], "11");
        assert_eq!(response.headers()["cache-control"], "no-store");

        let response = app.clone().oneshot(patch_request("hello.txt", 6, b"world")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[H_UPLOAD_OFFSET], "11");
        let body = body_json(response).await;
        assert_eq!(body["id"], "hello.txt");
        assert_eq!(body["size"], 11);
        assert_eq!(body["mimetype"], "text/plain");
        assert_eq!(body["url"], "/files/hello.txt");

        let response = app
            .oneshot(Request::builder().uri("/files/hello.txt").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello world");

        let stored = std::fs::read_to_string(tmp.path().join("hello.txt.json")).unwrap();
        assert!(!stored.contains("runtime"));
    }

    #[tokio::test]
    async fn test_repeated_create_replays_completion() {
        let hooks = RecordingHooks::new();
        let (app, tmp) = setup_app(hooks.clone());

        app.clone().oneshot(create_request("song.mp3", 4)).await.unwrap();
        app.clone().oneshot(patch_request("song.mp3", 0, b"beat")).await.unwrap();
        assert_eq!(hooks.finish_count(), 1);

        let retry = request("POST", "/files")
            .header(H_FILE_NAME, "song.mp3")
            .header(H_UPLOAD_LENGTH, "4")
            .header(H_METADATA, r#"{"title":"B%C3%A9bop"}"#)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(retry).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[H_UPLOAD_OFFSET], "4");
        assert_eq!(response.headers()[H_UPLOAD_LENGTH], "4");
        assert_eq!(response.headers()["location"], "/files/song.mp3");
        assert_eq!(response.headers()[H_FILE_EXIST], "true");

        assert_eq!(hooks.finish_count(), 2);
        assert_eq!(hooks.finished()[1].metadata["title"], "Bébop");
        assert_eq!(std::fs::read(tmp.path().join("song.mp3")).unwrap(), b"beat");
    }

    #[tokio::test]
    async fn test_patch_on_complete_upload_replays_completion() {
        let hooks = RecordingHooks::new();
        let (app, tmp) = setup_app(hooks.clone());

        app.clone().oneshot(create_request("clip.mp4", 4)).await.unwrap();
        app.clone().oneshot(patch_request("clip.mp4", 0, b"beat")).await.unwrap();
        assert_eq!(hooks.finish_count(), 1);

        let retry = request("PATCH", "/files/clip.mp4")
            .header("content-type", OFFSET_OCTET_STREAM)
            .header(H_UPLOAD_OFFSET, "0")
            .header(H_METADATA, r#"{"title":"%E2%9C%93"}"#)
            .header("content-length", "4")
            .body(Body::from(&b"beat"[..]))
            .unwrap();
        let response = app.oneshot(retry).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[H_UPLOAD_OFFSET], "4");
        assert_eq!(response.headers()[H_FILE_EXIST], "true");

        assert_eq!(hooks.finish_count(), 2);
        assert_eq!(hooks.finished()[1].metadata["title"], "\u{2713}");
        assert_eq!(std::fs::read(tmp.path().join("clip.mp4")).unwrap(), b"beat");
    }

    #[tokio::test]
    async fn test_patch_requires_offset_stream() {
        let (app, _tmp) = default_app();
        app.clone().oneshot(create_request("a.bin", 4)).await.unwrap();

        let response = app
            .clone()
            .oneshot(
                request("PATCH", "/files/a.bin")
                    .header("content-type", "application/json")
                    .header(H_UPLOAD_OFFSET, "0")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let response = app.oneshot(patch_request("a.bin", 2, b"ab")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_metadata_values_are_percent_decoded() {
        let (app, tmp) = default_app();
        let response = app
            .oneshot(
                request("POST", "/files")
                    .header(H_FILE_NAME, "pic.png")
                    .header(H_UPLOAD_LENGTH, "10")
                    .header(H_METADATA, r#"{"name":"%E4%BD%A0%E5%A5%BD.png"}"#)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let stored: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(tmp.path().join("pic.png.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(stored["metadata"]["name"], "你好.png");
    }

    #[tokio::test]
    async fn test_zero_byte_upload_completes_on_create() {
        let (app, _tmp) = default_app();
        let response = app.oneshot(create_request("empty.txt", 0)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[H_UPLOAD_OFFSET], "0");
        assert_eq!(response.headers()[H_FILE_EXIST], "true");
        let body = body_json(response).await;
        assert_eq!(body["size"], 0);
    }

    #[tokio::test]
    async fn test_failed_finish_rolls_back() {
        let (app, tmp) = setup_app(RecordingHooks::failing_finish());
        app.clone().oneshot(create_request("doc.pdf", 3)).await.unwrap();

        let response = app.clone().oneshot(patch_request("doc.pdf", 0, b"pdf")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[H_FILE_EXIST], "false");
        assert!(!tmp.path().join("doc.pdf").exists());

        let response = app
            .oneshot(request("HEAD", "/files/doc.pdf").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_traversal_name_is_forbidden() {
        let (app, tmp) = default_app();
        let response = app.oneshot(create_request("..%2F..%2Fescape.png", 3)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!tmp.path().parent().unwrap().join("escape.png").exists());
    }

    #[tokio::test]
    async fn test_base_url_header_overrides_location() {
        let (app, _tmp) = default_app();
        let response = app
            .oneshot(
                request("POST", "/files")
                    .header(H_FILE_NAME, "x.bin")
                    .header(H_UPLOAD_LENGTH, "5")
                    .header(H_BASE_URL, "https://edge.example.com/api/upload")
                    .header(H_FILE_ID, "client-7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers()["location"],
            "https://edge.example.com/api/upload/x.bin"
        );
        assert_eq!(response.headers()[H_FILE_ID], "client-7");
    }

    #[tokio::test]
    async fn test_delete_then_head_is_not_found() {
        let (app, _tmp) = default_app();
        app.clone().oneshot(create_request("gone.bin", 5)).await.unwrap();

        let response = app
            .clone()
            .oneshot(request("DELETE", "/files/gone.bin").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(request("HEAD", "/files/gone.bin").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(request("DELETE", "/files/gone.bin").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_health_and_openapi() {
        let (app, _tmp) = default_app();
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/openapi.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let doc = body_json(response).await;
        assert!(doc["paths"]["/files/{id}"].is_object());
    }
}
