//! Per-request state machine.
//!
//! A request moves `Received -> Authenticating -> Authorizing -> Routing
//! -> Forwarding -> Streaming` and ends either `Completed` or
//! `Aborted { stage, cause }`. [`RequestContext`] carries the request
//! through those stages and writes exactly one audit record when it
//! reaches a terminal state. Dropping a context that has not finished
//! (the client went away) records `ClientDisconnect` at the current
//! stage.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::http::header::WWW_AUTHENTICATE;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;

use crate::audit::{AuditRecord, AuditSink};
use crate::auth::{AuthFailure, Principal};
use crate::backend::BackendError;
use crate::module::ModuleId;
use crate::proxy::routing::Unroutable;
use crate::server::Stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Authenticating,
    Authorizing,
    Routing,
    Forwarding,
    Streaming,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Received => "received",
            Self::Authenticating => "authenticating",
            Self::Authorizing => "authorizing",
            Self::Routing => "routing",
            Self::Forwarding => "forwarding",
            Self::Streaming => "streaming",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortCause {
    AuthFailure(AuthFailure),
    PolicyDeny { rule: Option<usize> },
    Unroutable(Unroutable),
    BackendUnavailable(String),
    BackendError(BackendError),
    ClientDisconnect,
}

impl AbortCause {
    /// Status returned to the caller; `None` when nobody is listening.
    #[must_use]
    pub const fn status(&self) -> Option<StatusCode> {
        match self {
            Self::AuthFailure(_) => Some(StatusCode::UNAUTHORIZED),
            Self::PolicyDeny { .. } => Some(StatusCode::FORBIDDEN),
            Self::Unroutable(_) | Self::BackendError(_) => Some(StatusCode::BAD_GATEWAY),
            Self::BackendUnavailable(_) => Some(StatusCode::SERVICE_UNAVAILABLE),
            Self::ClientDisconnect => None,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AuthFailure(_) => "auth_failure",
            Self::PolicyDeny { .. } => "policy_deny",
            Self::Unroutable(_) => "unroutable",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::BackendError(_) => "backend_error",
            Self::ClientDisconnect => "client_disconnect",
        }
    }

    /// Reason shown to the caller. Backend details stay in the logs.
    fn public_reason(&self) -> &'static str {
        match self {
            Self::AuthFailure(f) => f.reason(),
            Self::PolicyDeny { .. } => "denied_by_policy",
            Self::Unroutable(u) => u.reason(),
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::BackendError(_) => "backend_error",
            Self::ClientDisconnect => "client_disconnect",
        }
    }
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthFailure(failure) => write!(f, "auth_failure: {failure}"),
            Self::PolicyDeny { rule: Some(idx) } => write!(f, "policy_deny: rule {idx}"),
            Self::PolicyDeny { rule: None } => f.write_str("policy_deny: no matching rule"),
            Self::Unroutable(u) => write!(f, "unroutable: {u}"),
            Self::BackendUnavailable(reason) => write!(f, "backend_unavailable: {reason}"),
            Self::BackendError(e) => write!(f, "backend_error: {e}"),
            Self::ClientDisconnect => f.write_str("client_disconnect"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    Aborted { stage: Stage, cause: AbortCause },
}

/// Where terminal transitions are reported.
#[derive(Clone)]
pub struct Recorder {
    pub audit: Arc<dyn AuditSink>,
    pub stats: Arc<Stats>,
}

/// The inbound request as the proxy core sees it.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: String,
    pub correlation_id: String,
}

pub struct RequestContext {
    pub request: InboundRequest,
    pub module: Option<ModuleId>,
    pub principal: Option<Principal>,
    pub attempts: u32,
    pub bytes: u64,
    stage: Stage,
    started: Instant,
    finished: bool,
    recorder: Recorder,
}

impl RequestContext {
    #[must_use]
    pub fn new(request: InboundRequest, recorder: Recorder) -> Self {
        Self {
            request,
            module: None,
            principal: None,
            attempts: 0,
            bytes: 0,
            stage: Stage::Received,
            started: Instant::now(),
            finished: false,
            recorder,
        }
    }

    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.request.correlation_id
    }

    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    pub fn advance(&mut self, next: Stage) {
        tracing::trace!(
            correlation_id = %self.request.correlation_id,
            from = %self.stage,
            to = %next,
            "stage transition"
        );
        self.stage = next;
    }

    /// Abort at the current stage and build the caller-facing response.
    pub fn abort(&mut self, cause: AbortCause) -> Response {
        let stage = self.stage;
        self.abort_at(stage, cause)
    }

    pub fn abort_at(&mut self, stage: Stage, cause: AbortCause) -> Response {
        self.stage = stage;
        let response = error_response(&cause, &self.request.correlation_id);
        self.finish(Outcome::Aborted { stage, cause });
        response
    }

    /// Record the terminal transition. Later calls are ignored.
    pub fn finish(&mut self, outcome: Outcome) {
        if self.finished {
            return;
        }
        self.finished = true;

        let counter = match outcome {
            Outcome::Completed => &self.recorder.stats.completed,
            Outcome::Aborted { .. } => &self.recorder.stats.aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let record = AuditRecord {
            correlation_id: self.request.correlation_id.clone(),
            method: self.request.method.to_string(),
            path: self.request.uri.path().to_string(),
            module: self.module,
            principal: self.principal.as_ref().map(|p| p.identity.clone()),
            outcome,
            attempts: self.attempts,
            bytes: self.bytes,
            elapsed_ms,
        };
        self.recorder.audit.record(&record);
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if !self.finished {
            let stage = self.stage;
            self.finish(Outcome::Aborted {
                stage,
                cause: AbortCause::ClientDisconnect,
            });
        }
    }
}

fn error_response(cause: &AbortCause, correlation_id: &str) -> Response {
    let status = cause.status().unwrap_or(StatusCode::BAD_REQUEST);
    let body = serde_json::json!({
        "error": cause.kind(),
        "reason": cause.public_reason(),
        "correlation_id": correlation_id,
    });

    let mut response = (status, Json(body)).into_response();
    let headers = response.headers_mut();
    if let Ok(val) = HeaderValue::from_str(correlation_id) {
        headers.insert("x-correlation-id", val);
    }
    if let AbortCause::AuthFailure(failure) = cause {
        let challenge = match failure {
            AuthFailure::MissingCredential => HeaderValue::from_static("Bearer"),
            _ => HeaderValue::from_static("Bearer error=\"invalid_token\""),
        };
        headers.insert(WWW_AUTHENTICATE, challenge);
    }
    response
}
