//! Uniform interface to the observability backends.
//!
//! Every module (tracing, metrics, logging) is reached through a
//! [`BackendAdapter`]. The proxy core only ever sees a
//! [`ForwardRequest`] going in and a [`BackendResponse`] with a streamed
//! body coming out; wire details stay inside the adapter. [`http`]
//! provides the HTTP adapter used for all three modules.

pub mod http;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::module::ModuleId;

pub type BodyStream = BoxStream<'static, Result<Bytes, BackendError>>;

#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Path (after any prefix stripping) plus query, always starting with `/`.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub correlation_id: String,
}

pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl std::fmt::Debug for BackendResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The connection could not be established; nothing reached the backend.
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("backend did not respond within {0}ms")]
    Timeout(u64),

    #[error("response body failed: {0}")]
    Body(String),
}

impl BackendError {
    /// Only connection failures are safe to retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connect(_))
    }
}

// async_trait is required here because adapters are stored as Arc<dyn BackendAdapter>.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn module(&self) -> ModuleId;

    async fn forward(&self, request: ForwardRequest) -> Result<BackendResponse, BackendError>;

    async fn health_check(&self) -> Result<(), BackendError>;
}
