//! The proxy core: authenticate, authorize, route, forward, stream.
//!
//! [`forward_handler`] is the Axum fallback that receives every
//! non-`/health` request and hands it to [`Gateway::handle`]. The gateway
//! owns the startup-time [`ModuleRegistry`] and per-module
//! [`ConnectionPool`]s; each request runs against a [`GatewaySnapshot`]
//! of the reloadable parts (credential keys, policy, routing) taken once
//! when the request arrives. Submodules cover the request state machine
//! ([`pipeline`]), module resolution ([`routing`]), header construction
//! ([`headers`]), bounded backend slots ([`pool`]) and response
//! streaming ([`relay`]).

pub mod headers;
pub mod pipeline;
pub mod pool;
pub mod relay;
pub mod routing;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;

use crate::audit::AuditSink;
use crate::auth::CredentialValidator;
use crate::backend::{BackendAdapter, BackendError, BackendResponse, ForwardRequest};
use crate::config::model::{Config, RetryConfig};
use crate::module::ModuleId;
use crate::policy::{Decision, PolicySet};
use crate::registry::ModuleRegistry;
use crate::server::{AppState, Stats};

use self::headers::{build_forwarded_headers, strip_response_hop_by_hop, ForwardContext};
use self::pipeline::{AbortCause, InboundRequest, Outcome, Recorder, RequestContext, Stage};
use self::pool::ConnectionPool;
use self::relay::Relay;
use self::routing::{ModuleRouter, RequestMeta};

/// The reloadable view of the configuration a request runs against.
#[derive(Debug)]
pub struct GatewaySnapshot {
    pub config: Arc<Config>,
    pub validator: CredentialValidator,
    pub policy: PolicySet,
    pub router: ModuleRouter,
}

impl GatewaySnapshot {
    #[must_use]
    pub fn from_config(config: Arc<Config>) -> Self {
        Self {
            validator: CredentialValidator::from_config(&config.auth),
            policy: PolicySet::from_config(&config.policy),
            router: ModuleRouter::from_config(&config.routing),
            config,
        }
    }
}

pub struct Gateway {
    registry: ModuleRegistry,
    pools: BTreeMap<ModuleId, ConnectionPool>,
    recorder: Recorder,
}

impl Gateway {
    #[must_use]
    pub fn new(
        registry: ModuleRegistry,
        pools: BTreeMap<ModuleId, ConnectionPool>,
        audit: Arc<dyn AuditSink>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            registry,
            pools,
            recorder: Recorder { audit, stats },
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    #[must_use]
    pub fn pool(&self, module: ModuleId) -> Option<&ConnectionPool> {
        self.pools.get(&module)
    }

    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.recorder.stats
    }

    pub async fn handle(&self, snapshot: Arc<GatewaySnapshot>, request: InboundRequest) -> Response {
        let mut ctx = RequestContext::new(request, self.recorder.clone());

        ctx.advance(Stage::Authenticating);
        let principal = match snapshot.validator.validate(&ctx.request.headers) {
            Ok(principal) => principal,
            Err(failure) => return ctx.abort(AbortCause::AuthFailure(failure)),
        };
        let identity = principal.identity.clone();

        ctx.advance(Stage::Authorizing);
        let resolution = snapshot.router.resolve(RequestMeta {
            uri: &ctx.request.uri,
            headers: &ctx.request.headers,
        });
        let resolved = match resolution {
            Ok(resolved) => resolved,
            Err(unroutable) => {
                ctx.principal = Some(principal);
                return ctx.abort_at(Stage::Routing, AbortCause::Unroutable(unroutable));
            }
        };
        let module = resolved.module;
        ctx.module = Some(module);

        let decision = snapshot.policy.authorize(&principal, module);
        ctx.principal = Some(principal);
        if let Decision::Deny { rule } = decision {
            return ctx.abort(AbortCause::PolicyDeny { rule });
        }

        ctx.advance(Stage::Routing);
        let (adapter, pool) = match (self.registry.lookup(module), self.pools.get(&module)) {
            (Ok(adapter), Some(pool)) => (Arc::clone(adapter), pool),
            _ => {
                return ctx.abort(AbortCause::BackendUnavailable(format!(
                    "module '{module}' is not enabled"
                )))
            }
        };

        ctx.advance(Stage::Forwarding);
        let permit = match pool.acquire().await {
            Ok(permit) => permit,
            Err(e) => return ctx.abort(AbortCause::BackendUnavailable(e.to_string())),
        };

        let config = &snapshot.config;
        let forwarded_headers = build_forwarded_headers(
            &ctx.request.headers,
            &ForwardContext {
                client_ip: &ctx.request.client_ip,
                correlation_id: &ctx.request.correlation_id,
                principal: &identity,
            },
            &config.defaults,
            &config.routing.marker_header,
        );
        let forward = ForwardRequest {
            method: ctx.request.method.clone(),
            path_and_query: resolved.forward_path,
            headers: forwarded_headers,
            body: ctx.request.body.clone(),
            correlation_id: ctx.request.correlation_id.clone(),
        };

        let response = match forward_with_retry(adapter.as_ref(), &forward, &config.retry, &mut ctx).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(
                    correlation_id = %ctx.correlation_id(),
                    module = %module,
                    attempts = ctx.attempts,
                    error = %e,
                    "forward failed"
                );
                return ctx.abort(AbortCause::BackendError(e));
            }
        };

        ctx.advance(Stage::Streaming);
        let BackendResponse {
            status,
            headers: mut resp_headers,
            body,
        } = response;
        strip_response_hop_by_hop(&mut resp_headers);
        if let Ok(cid) = HeaderValue::from_str(ctx.correlation_id()) {
            resp_headers.insert("x-correlation-id", cid);
        }

        // hyper drops these bodies unpolled, so the relay would never see the end.
        let relayed_body = if has_no_body(&ctx.request.method, status) {
            drop(body);
            drop(permit);
            ctx.finish(Outcome::Completed);
            Body::empty()
        } else {
            Body::from_stream(Relay::new(body, ctx, permit))
        };

        let mut relayed = Response::new(relayed_body);
        *relayed.status_mut() = status;
        *relayed.headers_mut() = resp_headers;
        relayed
    }
}

/// Responses that never carry a body on the wire.
fn has_no_body(method: &Method, status: StatusCode) -> bool {
    *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// Forward with bounded retries on transient connection failures only.
///
/// Nothing has reached the caller while this runs, so a retry can never
/// duplicate relayed bytes. A backend response of any status ends the loop.
async fn forward_with_retry(
    adapter: &dyn BackendAdapter,
    request: &ForwardRequest,
    retry: &RetryConfig,
    ctx: &mut RequestContext,
) -> Result<BackendResponse, BackendError> {
    let max_attempts = retry.max_attempts.max(1);
    loop {
        ctx.attempts += 1;
        match adapter.forward(request.clone()).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_transient() && ctx.attempts < max_attempts => {
                let delay = backoff_delay(retry, ctx.attempts);
                tracing::warn!(
                    correlation_id = %ctx.correlation_id(),
                    module = %adapter.module(),
                    attempt = ctx.attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "transient backend failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// `base * 2^(attempt - 1)`, capped at `max_backoff_ms`.
#[must_use]
pub fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let ms = retry
        .base_backoff_ms
        .saturating_mul(1u64 << exponent)
        .min(retry.max_backoff_ms);
    Duration::from_millis(ms)
}

pub async fn forward_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    req_headers: HeaderMap,
    body: Bytes,
) -> Response {
    let correlation_id = req_headers
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from);

    let snapshot = state.snapshot().await;

    tracing::debug!(
        correlation_id = %correlation_id,
        method = %method,
        path = %uri.path(),
        "request received"
    );

    let request = InboundRequest {
        method,
        uri,
        headers: req_headers,
        body,
        client_ip: addr.ip().to_string(),
        correlation_id,
    };

    state.gateway.handle(snapshot, request).await
}
