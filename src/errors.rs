//! Upload protocol error types.
//!
//! Every variant maps to a stable error code and HTTP status.  The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(UploadError::NotFound { .. })`.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::hooks::HookError;
use crate::protocol::{H_FILE_EXIST, H_TUS_RESUMABLE, H_TUS_VERSION, TUS_RESUMABLE, TUS_VERSION};
use crate::storage::backend::PathEscape;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Upload protocol errors.
#[derive(Debug, Error)]
pub enum UploadError {
    /// No record exists for the upload.
    #[error("The upload does not exist")]
    NotFound { id: String },

    /// The declared offset does not match the durable offset.
    #[error("Upload-Offset {received} does not match the current offset {expected}")]
    OffsetMismatch { expected: u64, received: u64 },

    /// The upload passed its expiry window.
    #[error("The upload has expired")]
    Gone { id: String },

    /// A protocol header is missing or malformed.
    #[error("{message}")]
    InvalidHeader { message: String },

    /// PATCH body without `application/offset+octet-stream`.
    #[error("Content-Type must be application/offset+octet-stream")]
    UnsupportedMediaType,

    /// The client speaks a protocol version we do not.
    #[error("Unsupported Tus-Resumable version")]
    UnsupportedVersion,

    /// The upload would exceed its declared size or the server maximum.
    #[error("{message}")]
    SizeExceeded { message: String },

    /// The create hook refused the upload.
    #[error("{reason}")]
    Vetoed { reason: String },

    /// A computed file name escapes the storage directory.
    #[error("Invalid file name")]
    PathTraversal(#[from] PathEscape),

    /// The create hook failed.
    #[error(transparent)]
    Hook(#[from] HookError),

    /// The finish hook failed; the upload was rolled back.
    #[error("{0}")]
    FinishRolledBack(HookError),

    /// Catch-all for unexpected internal errors.
    #[error("We encountered an internal error, please try again.")]
    Internal(#[from] anyhow::Error),
}

impl UploadError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::NotFound { .. } => "NotFound",
            UploadError::OffsetMismatch { .. } => "OffsetMismatch",
            UploadError::Gone { .. } => "UploadExpired",
            UploadError::InvalidHeader { .. } => "InvalidHeader",
            UploadError::UnsupportedMediaType => "UnsupportedMediaType",
            UploadError::UnsupportedVersion => "UnsupportedVersion",
            UploadError::SizeExceeded { .. } => "SizeExceeded",
            UploadError::Vetoed { .. } => "UploadRejected",
            UploadError::PathTraversal(_) => "InvalidFileName",
            UploadError::Hook(_) => "HookFailed",
            UploadError::FinishRolledBack(_) => "FinishFailed",
            UploadError::Internal(_) => "InternalError",
        }
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UploadError::NotFound { .. } => StatusCode::NOT_FOUND,
            UploadError::OffsetMismatch { .. } => StatusCode::CONFLICT,
            UploadError::Gone { .. } => StatusCode::GONE,
            UploadError::InvalidHeader { .. } => StatusCode::BAD_REQUEST,
            UploadError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            UploadError::UnsupportedVersion => StatusCode::PRECONDITION_FAILED,
            UploadError::SizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::Vetoed { .. } => StatusCode::FORBIDDEN,
            UploadError::PathTraversal(_) => StatusCode::FORBIDDEN,
            UploadError::Hook(e) | UploadError::FinishRolledBack(e) => e.status,
            UploadError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the response should tell the client the file is absent.
    fn reports_missing_file(&self) -> bool {
        matches!(
            self,
            UploadError::NotFound { .. } | UploadError::Gone { .. } | UploadError::FinishRolledBack(_)
        )
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        if let UploadError::Internal(e) = &self {
            tracing::error!(error = ?e, "internal error while handling upload request");
        }

        let status = self.status_code();
        let body = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        let mut response = (status, axum::Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(H_TUS_RESUMABLE, HeaderValue::from_static(TUS_RESUMABLE));
        if let Ok(id) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", id);
        }
        if matches!(self, UploadError::UnsupportedVersion) {
            headers.insert(H_TUS_VERSION, HeaderValue::from_static(TUS_VERSION));
        }
        if self.reports_missing_file() {
            headers.insert(H_FILE_EXIST, HeaderValue::from_static("false"));
        }
        response
    }
}
