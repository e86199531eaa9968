//! Prometheus metrics for Chunkyard.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a middleware for HTTP RED
//! metrics, and exposes the `/metrics` endpoint handler.

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "chunkyard_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "chunkyard_http_request_duration_seconds";

/// Uploads accepted by the create path (counter).
pub const UPLOADS_CREATED_TOTAL: &str = "chunkyard_uploads_created_total";

/// Uploads that reached their declared size and finished (counter).
pub const UPLOADS_FINISHED_TOTAL: &str = "chunkyard_uploads_finished_total";

/// Total chunk bytes written to disk (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "chunkyard_bytes_received_total";

/// Requests short-circuited by the existence guard (counter).
pub const GUARD_HITS_TOTAL: &str = "chunkyard_existence_guard_hits_total";

/// Uploads rolled back after a failed finish hook (counter).
pub const FINISH_ROLLBACKS_TOTAL: &str = "chunkyard_finish_rollbacks_total";

/// Expired uploads removed by the reaper (counter).
pub const UPLOADS_REAPED_TOTAL: &str = "chunkyard_uploads_reaped_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(UPLOADS_CREATED_TOTAL, "Uploads created");
    describe_counter!(UPLOADS_FINISHED_TOTAL, "Uploads finished");
    describe_counter!(BYTES_RECEIVED_TOTAL, "Chunk bytes written to disk");
    describe_counter!(GUARD_HITS_TOTAL, "Requests answered by the existence guard");
    describe_counter!(FINISH_ROLLBACKS_TOTAL, "Uploads rolled back after a finish failure");
    describe_counter!(UPLOADS_REAPED_TOTAL, "Expired uploads removed");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation. The state is the upload
/// collection's base path, used to fold upload ids into one label.
pub async fn metrics_middleware(
    State(base_path): State<Arc<str>>,
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path(), &base_path);

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize a request path to a route template for metric labels, so
/// upload ids never become label values. `base_path` is the collection
/// route; anything outside the known routes collapses to `/{other}`.
///
/// - `/health` -> `/health`
/// - `/files` -> `/{collection}`
/// - `/files/abc.png` -> `/{collection}/{id}`
fn normalize_path(path: &str, base_path: &str) -> String {
    let base = base_path.trim_end_matches('/');
    match path {
        "/" if base.is_empty() => return "/{collection}".to_string(),
        "/" | "/health" | "/openapi.json" | "/metrics" => return path.to_string(),
        _ => {}
    }
    let rest = match path.strip_prefix(base) {
        Some(rest) => rest.trim_end_matches('/'),
        None => return "/{other}".to_string(),
    };
    if rest.is_empty() {
        return "/{collection}".to_string();
    }
    match rest.strip_prefix('/') {
        Some(id) if !id.contains('/') => "/{collection}/{id}".to_string(),
        _ => "/{other}".to_string(),
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let body = init_metrics().render();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

// -- Tests --------------------------------------------------------------------
