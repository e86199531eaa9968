//! Lifecycle hooks supplied by the embedding application.
//!
//! The engine calls [`UploadHooks::on_upload_create`] before accepting a
//! new upload and [`UploadHooks::on_upload_finish`] once per completion
//! (and again when the existence guard replays a completion). A finish
//! error makes the engine roll the upload back.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use axum::http::{HeaderMap, Method, StatusCode};
use serde_json::json;

use crate::metadata::record::UploadRecord;

/// What a hook gets to see of the inbound request.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub method: Method,
    pub headers: HeaderMap,
    /// Request query merged with the `x-uploader-endpoint-url` query.
    pub query: BTreeMap<String, String>,
}

impl HookContext {
    pub fn new(method: Method, headers: HeaderMap, query: BTreeMap<String, String>) -> Self {
        Self {
            method,
            headers,
            query,
        }
    }
}

/// Outcome of `on_upload_create`.
#[derive(Debug, Clone)]
pub enum CreateDecision {
    /// Accept, possibly with an annotated record.
    Accept(UploadRecord),
    /// Refuse the upload with a reason shown to the client.
    Veto(String),
}

/// Outcome of `on_upload_finish`.
#[derive(Debug, Clone, PartialEq)]
pub enum FinishReply {
    /// Respond `200` with this JSON body.
    Json(serde_json::Value),
    /// Send the regular protocol response.
    Continue,
}

/// Failure raised by a hook.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HookError {
    /// Status the client should see.
    pub status: StatusCode,
    pub message: String,
}

impl HookError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

/// Boxed future returned by hook methods.
pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, HookError>> + Send + 'a>>;

/// Embedding-application callbacks.
pub trait UploadHooks: Send + Sync + 'static {
    /// Called before a new upload accepts any bytes.
    fn on_upload_create<'a>(
        &'a self,
        ctx: &'a HookContext,
        record: UploadRecord,
    ) -> HookFuture<'a, CreateDecision>;

    /// Called with the reconciled record once every byte is durable.
    fn on_upload_finish<'a>(
        &'a self,
        ctx: &'a HookContext,
        record: &'a UploadRecord,
    ) -> HookFuture<'a, FinishReply>;
}

/// Hooks used by the standalone server: accept everything and answer
/// completions with a small JSON description of the file.
pub struct DefaultHooks {
    public_url: Option<String>,
    base_path: String,
}

impl DefaultHooks {
    pub fn new(public_url: Option<String>, base_path: impl Into<String>) -> Self {
        Self {
            public_url: public_url.filter(|u| !u.is_empty()),
            base_path: base_path.into(),
        }
    }

    fn url_for(&self, id: &str) -> String {
        match &self.public_url {
            Some(base) => format!("{}/{id}", base.trim_end_matches('/')),
            None => format!("{}/{id}", self.base_path.trim_end_matches('/')),
        }
    }
}

impl UploadHooks for DefaultHooks {
    fn on_upload_create<'a>(
        &'a self,
        _ctx: &'a HookContext,
        record: UploadRecord,
    ) -> HookFuture<'a, CreateDecision> {
        Box::pin(async move { Ok(CreateDecision::Accept(record)) })
    }

    fn on_upload_finish<'a>(
        &'a self,
        _ctx: &'a HookContext,
        record: &'a UploadRecord,
    ) -> HookFuture<'a, FinishReply> {
        Box::pin(async move {
            Ok(FinishReply::Json(json!({
                "id": record.id,
                "filename": record.original_name(),
                "size": record.size.unwrap_or(record.offset),
                "mimetype": record.content_type(),
                "meta": record.metadata,
                "url": self.url_for(&record.id),
            })))
        })
    }
}
