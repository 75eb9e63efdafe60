//! End-to-end tests of the request state machine with stub backends.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;

use watchtower::audit::{AuditRecord, MemoryAuditSink};
use watchtower::auth::AuthFailure;
use watchtower::backend::{BackendAdapter, BackendError, BackendResponse, ForwardRequest};
use watchtower::config::model::Config;
use watchtower::config::ConfigVersion;
use watchtower::module::ModuleId;
use watchtower::proxy::pipeline::{AbortCause, InboundRequest, Outcome, Stage};
use watchtower::proxy::pool::ConnectionPool;
use watchtower::proxy::routing::Unroutable;
use watchtower::proxy::{Gateway, GatewaySnapshot};
use watchtower::registry::ModuleRegistryBuilder;
use watchtower::server::{AppState, LoadedConfig, Stats};

const SECRET: &str = "integration-secret";

// -- Stub backend --

/// Sets its flag when dropped, i.e. when the response stream it rides in
/// is cancelled or finished.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct StubBackend {
    module: ModuleId,
    calls: AtomicU32,
    connect_failures: u32,
    /// Returned on every call once the connect failures are used up.
    forward_error: Option<BackendError>,
    status: StatusCode,
    chunks: Vec<&'static str>,
    /// End the body with an error after the chunks.
    fail_after_chunks: bool,
    /// Keep the body open after the chunks instead of ending it.
    hang_after_chunks: bool,
    body_dropped: Arc<AtomicBool>,
    last_request: Mutex<Option<ForwardRequest>>,
}

impl StubBackend {
    fn new(module: ModuleId) -> Self {
        Self {
            module,
            calls: AtomicU32::new(0),
            connect_failures: 0,
            forward_error: None,
            status: StatusCode::OK,
            chunks: vec!["ok"],
            fail_after_chunks: false,
            hang_after_chunks: false,
            body_dropped: Arc::new(AtomicBool::new(false)),
            last_request: Mutex::new(None),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_request(&self) -> ForwardRequest {
        self.last_request.lock().unwrap().clone().unwrap()
    }
}

#[async_trait]
impl BackendAdapter for StubBackend {
    fn module(&self) -> ModuleId {
        self.module
    }

    async fn forward(&self, request: ForwardRequest) -> Result<BackendResponse, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_request.lock().unwrap() = Some(request);
        if call <= self.connect_failures {
            return Err(BackendError::Connect("connection refused".into()));
        }
        if let Some(error) = &self.forward_error {
            return Err(error.clone());
        }

        let flag = DropFlag(self.body_dropped.clone());
        let mut items: Vec<Result<Bytes, BackendError>> = self
            .chunks
            .iter()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        if self.fail_after_chunks {
            items.push(Err(BackendError::Body("stream reset".into())));
        }
        let chunks = futures::stream::iter(items);
        let body = if self.hang_after_chunks {
            chunks.chain(futures::stream::pending()).boxed()
        } else {
            chunks.boxed()
        };
        let body = body
            .map(move |item| {
                let _keep = &flag;
                item
            })
            .boxed();

        Ok(BackendResponse {
            status: self.status,
            headers: HeaderMap::new(),
            body,
        })
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

// -- Harness --

fn config(policy: serde_json::Value) -> Config {
    serde_json::from_value(json!({
        "modules": {
            "tracing": { "url": "http://tempo:3200" },
            "metrics": { "url": "http://prometheus:9090" },
            "logging": { "url": "http://loki:3100" }
        },
        "auth": { "keys": [{ "id": "primary", "secret": SECRET }] },
        "policy": policy,
        "retry": { "max_attempts": 3, "base_backoff_ms": 10, "max_backoff_ms": 100 }
    }))
    .unwrap()
}

fn default_policy() -> serde_json::Value {
    json!([
        { "scope": "metrics:*", "module": "metrics", "effect": "allow" },
        { "scope": "traces:read", "module": "tracing", "effect": "allow" },
        { "scope": "logs:*", "module": "logging", "effect": "allow" }
    ])
}

fn token(sub: &str, scope: &str) -> String {
    let exp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 600;
    encode(
        &Header::default(),
        &json!({ "sub": sub, "exp": exp, "scope": scope }),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn request(path: &str, bearer: Option<&str>) -> InboundRequest {
    request_with(Method::GET, path, bearer)
}

fn request_with(method: Method, path: &str, bearer: Option<&str>) -> InboundRequest {
    let mut headers = HeaderMap::new();
    if let Some(token) = bearer {
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
    }
    InboundRequest {
        method,
        uri: path.parse::<Uri>().unwrap(),
        headers,
        body: Bytes::new(),
        client_ip: "10.0.0.7".into(),
        correlation_id: "cid-test".into(),
    }
}

struct Harness {
    gateway: Gateway,
    snapshot: Arc<GatewaySnapshot>,
    sink: Arc<MemoryAuditSink>,
}

fn harness(config: Config, backends: &[Arc<StubBackend>]) -> Harness {
    let mut builder = ModuleRegistryBuilder::new();
    let mut pools = BTreeMap::new();
    for backend in backends {
        builder.register(backend.module, backend.clone());
        pools.insert(
            backend.module,
            ConnectionPool::new(4, Duration::from_millis(200)),
        );
    }
    let sink = Arc::new(MemoryAuditSink::new());
    Harness {
        gateway: Gateway::new(builder.build(), pools, sink.clone(), Arc::new(Stats::new())),
        snapshot: Arc::new(GatewaySnapshot::from_config(Arc::new(config))),
        sink,
    }
}

impl Harness {
    async fn send(&self, request: InboundRequest) -> Response {
        self.gateway.handle(self.snapshot.clone(), request).await
    }

    fn only_record(&self) -> AuditRecord {
        let records = self.sink.records();
        assert_eq!(records.len(), 1, "expected one audit record: {records:?}");
        records.into_iter().next().unwrap()
    }
}

async fn body_string(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn aborted(stage: Stage, cause: AbortCause) -> Outcome {
    Outcome::Aborted { stage, cause }
}

// -- Scenarios --

#[tokio::test]
async fn allowed_metrics_request_completes_with_one_forward() {
    let metrics = Arc::new(StubBackend::new(ModuleId::Metrics));
    let h = harness(config(default_policy()), &[metrics.clone()]);

    let response = h
        .send(request("/metrics/api/v1/query?query=up", Some(&token("alice", "metrics:read"))))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-correlation-id"], "cid-test");
    assert_eq!(body_string(response).await, "ok");

    assert_eq!(metrics.calls(), 1);
    let record = h.only_record();
    assert_eq!(record.outcome, Outcome::Completed);
    assert_eq!(record.module, Some(ModuleId::Metrics));
    assert_eq!(record.principal.as_deref(), Some("alice"));
    assert_eq!(record.attempts, 1);
    assert_eq!(record.bytes, 2);

    let forwarded = metrics.last_request();
    assert_eq!(forwarded.path_and_query, "/api/v1/query?query=up");
    assert!(forwarded.headers.get("authorization").is_none());
    assert_eq!(forwarded.headers["x-watchtower-principal"], "alice");
    assert_eq!(forwarded.headers["x-forwarded-for"], "10.0.0.7");
}

#[tokio::test]
async fn unregistered_module_aborts_at_routing_without_forwarding() {
    let metrics = Arc::new(StubBackend::new(ModuleId::Metrics));
    let h = harness(config(default_policy()), &[metrics.clone()]);

    let response = h
        .send(request("/tracing/api/traces/abc", Some(&token("bob", "traces:read"))))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(metrics.calls(), 0);

    let record = h.only_record();
    assert!(matches!(
        record.outcome,
        Outcome::Aborted {
            stage: Stage::Routing,
            cause: AbortCause::BackendUnavailable(_),
        }
    ));
    assert_eq!(record.attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_until_success() {
    let logging = Arc::new(StubBackend {
        connect_failures: 2,
        ..StubBackend::new(ModuleId::Logging)
    });
    let h = harness(config(default_policy()), &[logging.clone()]);

    let response = h
        .send(request("/logging/loki/api/v1/labels", Some(&token("carol", "logs:read"))))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "ok");

    assert_eq!(logging.calls(), 3);
    let record = h.only_record();
    assert_eq!(record.outcome, Outcome::Completed);
    assert_eq!(record.attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_abort_with_backend_error() {
    let logging = Arc::new(StubBackend {
        connect_failures: 10,
        ..StubBackend::new(ModuleId::Logging)
    });
    let h = harness(config(default_policy()), &[logging.clone()]);

    let response = h
        .send(request("/logging/ready", Some(&token("carol", "logs:read"))))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(logging.calls(), 3);

    let record = h.only_record();
    assert_eq!(
        record.outcome,
        aborted(
            Stage::Forwarding,
            AbortCause::BackendError(BackendError::Connect("connection refused".into()))
        )
    );
    assert_eq!(record.attempts, 3);
}

#[tokio::test]
async fn non_transient_errors_are_not_retried() {
    for error in [
        BackendError::Timeout(30_000),
        BackendError::Request("connection reset after send".into()),
    ] {
        let metrics = Arc::new(StubBackend {
            forward_error: Some(error.clone()),
            ..StubBackend::new(ModuleId::Metrics)
        });
        let h = harness(config(default_policy()), &[metrics.clone()]);

        let response = h
            .send(request("/metrics/api/v1/query", Some(&token("ivan", "metrics:read"))))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(metrics.calls(), 1);

        let record = h.only_record();
        assert_eq!(
            record.outcome,
            aborted(Stage::Forwarding, AbortCause::BackendError(error))
        );
        assert_eq!(record.attempts, 1);
        assert_eq!(h.gateway.pool(ModuleId::Metrics).unwrap().in_use(), 0);
    }
}

#[tokio::test]
async fn backend_error_mid_body_aborts_streaming_without_retry() {
    let metrics = Arc::new(StubBackend {
        chunks: vec!["partial"],
        fail_after_chunks: true,
        ..StubBackend::new(ModuleId::Metrics)
    });
    let h = harness(config(default_policy()), &[metrics.clone()]);

    let response = h
        .send(request("/metrics/federate", Some(&token("judy", "metrics:read"))))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let frame = body.frame().await.unwrap().unwrap();
    assert_eq!(frame.into_data().unwrap(), "partial");
    assert!(body.frame().await.unwrap().is_err());

    assert_eq!(metrics.calls(), 1);
    let record = h.only_record();
    assert_eq!(
        record.outcome,
        aborted(
            Stage::Streaming,
            AbortCause::BackendError(BackendError::Body("stream reset".into()))
        )
    );
    assert_eq!(record.attempts, 1);
    assert_eq!(record.bytes, 7);
    assert!(metrics.body_dropped.load(Ordering::SeqCst));
    assert_eq!(h.gateway.pool(ModuleId::Metrics).unwrap().in_use(), 0);

    drop(body);
    assert_eq!(h.sink.records().len(), 1);
}

#[tokio::test]
async fn bodiless_responses_complete_without_being_read() {
    let head = Arc::new(StubBackend::new(ModuleId::Metrics));
    let h = harness(config(default_policy()), &[head.clone()]);
    let response = h
        .send(request_with(
            Method::HEAD,
            "/metrics/api/v1/query",
            Some(&token("kim", "metrics:read")),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    drop(response);
    assert_eq!(h.only_record().outcome, Outcome::Completed);
    assert!(head.body_dropped.load(Ordering::SeqCst));
    assert_eq!(h.gateway.pool(ModuleId::Metrics).unwrap().in_use(), 0);

    for status in [StatusCode::NO_CONTENT, StatusCode::NOT_MODIFIED] {
        let metrics = Arc::new(StubBackend {
            status,
            hang_after_chunks: true,
            ..StubBackend::new(ModuleId::Metrics)
        });
        let h = harness(config(default_policy()), &[metrics.clone()]);
        let response = h
            .send(request("/metrics/api/v1/query", Some(&token("kim", "metrics:read"))))
            .await;
        assert_eq!(response.status(), status);
        assert_eq!(h.only_record().outcome, Outcome::Completed);
        assert_eq!(h.gateway.pool(ModuleId::Metrics).unwrap().in_use(), 0);
        drop(response);
        assert_eq!(h.sink.records().len(), 1);
    }
}

#[tokio::test]
async fn client_disconnect_mid_stream_cancels_backend() {
    let metrics = Arc::new(StubBackend {
        chunks: vec!["first-chunk"],
        hang_after_chunks: true,
        ..StubBackend::new(ModuleId::Metrics)
    });
    let h = harness(config(default_policy()), &[metrics.clone()]);

    let response = h
        .send(request("/metrics/federate", Some(&token("dave", "metrics:read"))))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let frame = body.frame().await.unwrap().unwrap();
    assert_eq!(frame.into_data().unwrap(), "first-chunk");
    assert!(!metrics.body_dropped.load(Ordering::SeqCst));

    // The caller goes away while the backend still has more to send.
    drop(body);

    assert!(metrics.body_dropped.load(Ordering::SeqCst));
    assert_eq!(metrics.calls(), 1);
    let record = h.only_record();
    assert_eq!(
        record.outcome,
        aborted(Stage::Streaming, AbortCause::ClientDisconnect)
    );
    assert_eq!(record.attempts, 1);
    assert_eq!(record.bytes, 11);
    assert_eq!(h.gateway.pool(ModuleId::Metrics).unwrap().in_use(), 0);
}

#[tokio::test]
async fn missing_credentials_are_rejected_before_forwarding() {
    let metrics = Arc::new(StubBackend::new(ModuleId::Metrics));
    let h = harness(config(default_policy()), &[metrics.clone()]);

    let response = h.send(request("/metrics/api/v1/query", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()["www-authenticate"], "Bearer");

    let body: serde_json::Value =
        serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["error"], "auth_failure");
    assert_eq!(body["correlation_id"], "cid-test");

    assert_eq!(metrics.calls(), 0);
    assert_eq!(
        h.only_record().outcome,
        aborted(
            Stage::Authenticating,
            AbortCause::AuthFailure(AuthFailure::MissingCredential)
        )
    );
}

#[tokio::test]
async fn token_signed_with_another_secret_is_rejected() {
    let metrics = Arc::new(StubBackend::new(ModuleId::Metrics));
    let h = harness(config(default_policy()), &[metrics.clone()]);

    let exp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 600;
    let forged = encode(
        &Header::default(),
        &json!({ "sub": "mallory", "exp": exp, "scope": "metrics:read" }),
        &EncodingKey::from_secret(b"not-the-secret"),
    )
    .unwrap();

    let response = h.send(request("/metrics/api/v1/query", Some(&forged))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(metrics.calls(), 0);
    assert_eq!(
        h.only_record().outcome,
        aborted(
            Stage::Authenticating,
            AbortCause::AuthFailure(AuthFailure::SignatureInvalid)
        )
    );
}

#[tokio::test]
async fn no_matching_policy_rule_denies() {
    let metrics = Arc::new(StubBackend::new(ModuleId::Metrics));

    for policy in [json!([]), json!([{ "scope": "logs:*", "module": "logging", "effect": "allow" }])] {
        let h = harness(config(policy), &[metrics.clone()]);
        let response = h
            .send(request("/metrics/api/v1/query", Some(&token("erin", "metrics:read"))))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            h.only_record().outcome,
            aborted(Stage::Authorizing, AbortCause::PolicyDeny { rule: None })
        );
    }
    assert_eq!(metrics.calls(), 0);
}

#[tokio::test]
async fn unroutable_request_aborts_at_routing() {
    let metrics = Arc::new(StubBackend::new(ModuleId::Metrics));
    let h = harness(config(default_policy()), &[metrics.clone()]);

    let response = h
        .send(request("/unknown/path", Some(&token("frank", "metrics:read"))))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let record = h.only_record();
    assert_eq!(
        record.outcome,
        aborted(Stage::Routing, AbortCause::Unroutable(Unroutable::NoMatch))
    );
    assert_eq!(record.principal.as_deref(), Some("frank"));
    assert_eq!(metrics.calls(), 0);
}

#[tokio::test]
async fn exhausted_pool_turns_request_away() {
    let metrics = Arc::new(StubBackend {
        hang_after_chunks: true,
        ..StubBackend::new(ModuleId::Metrics)
    });
    let mut builder = ModuleRegistryBuilder::new();
    builder.register(ModuleId::Metrics, metrics.clone());
    let pools = BTreeMap::from([(
        ModuleId::Metrics,
        ConnectionPool::new(1, Duration::from_millis(20)),
    )]);
    let sink = Arc::new(MemoryAuditSink::new());
    let gateway = Gateway::new(builder.build(), pools, sink.clone(), Arc::new(Stats::new()));
    let snapshot = Arc::new(GatewaySnapshot::from_config(Arc::new(config(default_policy()))));
    let bearer = token("gina", "metrics:read");

    // First response holds the only slot while its body is open.
    let held = gateway
        .handle(snapshot.clone(), request("/metrics/a", Some(&bearer)))
        .await;
    let second = gateway
        .handle(snapshot.clone(), request("/metrics/b", Some(&bearer)))
        .await;
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(metrics.calls(), 1);

    drop(held);
    let third = gateway
        .handle(snapshot, request("/metrics/c", Some(&bearer)))
        .await;
    assert_eq!(third.status(), StatusCode::OK);
    assert_eq!(metrics.calls(), 2);
}

#[tokio::test]
async fn stats_count_terminal_outcomes() {
    let metrics = Arc::new(StubBackend::new(ModuleId::Metrics));
    let h = harness(config(default_policy()), &[metrics]);

    let ok = h
        .send(request("/metrics/q", Some(&token("hana", "metrics:read"))))
        .await;
    body_string(ok).await;
    let _ = h.send(request("/metrics/q", None)).await;

    let stats = h.gateway.stats();
    assert_eq!(stats.completed.load(Ordering::Relaxed), 1);
    assert_eq!(stats.aborted.load(Ordering::Relaxed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_snapshot_swaps_are_all_or_nothing() {
    let old_policy = default_policy();
    let new_policy = json!([
        { "scope": "metrics:*", "module": "metrics", "effect": "deny" },
        { "scope": "a", "module": "tracing", "effect": "allow" },
        { "scope": "b", "module": "tracing", "effect": "allow" },
        { "scope": "c", "module": "tracing", "effect": "allow" },
        { "scope": "d", "module": "tracing", "effect": "allow" }
    ]);

    let gateway = Gateway::new(
        ModuleRegistryBuilder::new().build(),
        BTreeMap::new(),
        Arc::new(MemoryAuditSink::new()),
        Arc::new(Stats::new()),
    );
    let loaded = |policy: &serde_json::Value| {
        LoadedConfig::new(
            GatewaySnapshot::from_config(Arc::new(config(policy.clone()))),
            ConfigVersion::Hash(format!("{}", policy.as_array().unwrap().len())),
            "test".into(),
        )
    };
    let state = Arc::new(AppState::new(loaded(&old_policy), gateway));

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let state = state.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let snapshot = state.snapshot().await;
                    let rules = snapshot.policy.rules();
                    match rules.len() {
                        3 => assert_eq!(rules[0].effect, watchtower::policy::Effect::Allow),
                        5 => assert_eq!(rules[0].effect, watchtower::policy::Effect::Deny),
                        n => panic!("saw a partial rule set of {n} rules"),
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for i in 0..50 {
        let policy = if i % 2 == 0 { &new_policy } else { &old_policy };
        state.replace_config(loaded(policy)).await;
        tokio::task::yield_now().await;
    }

    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(
        state.gateway.stats().config_reloads.load(Ordering::Relaxed),
        50
    );
}
