//! Integration tests for module resolution against the full example config.

use axum::http::{HeaderMap, HeaderValue, Uri};
use watchtower::config::model::{Config, Defaults};
use watchtower::config::sources::parse_config_str;
use watchtower::module::ModuleId;
use watchtower::proxy::routing::{ModuleRouter, RequestMeta, Resolved, Unroutable};

fn full_router() -> ModuleRouter {
    let content = std::fs::read_to_string("example/full.yaml").unwrap();
    let config: Config = parse_config_str("yaml", &content, "full.yaml").unwrap();
    ModuleRouter::from_config(&config.routing)
}

fn resolve(router: &ModuleRouter, uri: &str, headers: &[(&str, &str)]) -> Result<Resolved, Unroutable> {
    let uri: Uri = uri.parse().unwrap();
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    router.resolve(RequestMeta {
        uri: &uri,
        headers: &map,
    })
}

#[test]
fn prefixes_route_and_strip() {
    let router = full_router();

    let r = resolve(&router, "/metrics/api/v1/query?query=up", &[]).unwrap();
    assert_eq!(r.module, ModuleId::Metrics);
    assert_eq!(r.forward_path, "/api/v1/query?query=up");

    let r = resolve(&router, "/logging/loki/api/v1/labels", &[]).unwrap();
    assert_eq!(r.module, ModuleId::Logging);
    assert_eq!(r.forward_path, "/loki/api/v1/labels");
}

#[test]
fn unstripped_prefix_is_forwarded_verbatim() {
    let router = full_router();
    let r = resolve(&router, "/api/v1/series", &[]).unwrap();
    assert_eq!(r.module, ModuleId::Metrics);
    assert_eq!(r.forward_path, "/api/v1/series");
}

#[test]
fn host_rule_outranks_prefix_rule() {
    let router = full_router();
    let r = resolve(&router, "/metrics/api", &[("host", "Traces.Example.com:443")]).unwrap();
    assert_eq!(r.module, ModuleId::Tracing);
    assert_eq!(r.forward_path, "/metrics/api");
}

#[test]
fn host_and_prefix_together_are_most_specific() {
    let router = full_router();
    let r = resolve(&router, "/loki/api/v1/push", &[("host", "logs.example.com")]).unwrap();
    assert_eq!(r.module, ModuleId::Logging);
    assert_eq!(r.forward_path, "/loki/api/v1/push");

    // Same path on another host matches nothing.
    assert_eq!(
        resolve(&router, "/loki/api/v1/push", &[("host", "other.example.com")]),
        Err(Unroutable::NoMatch)
    );
}

#[test]
fn marker_header_agreeing_with_rule_is_accepted() {
    let router = full_router();
    let r = resolve(&router, "/tracing/api/traces", &[("x-watchtower-module", "Tracing")]).unwrap();
    assert_eq!(r.module, ModuleId::Tracing);
}

#[test]
fn marker_header_conflicting_with_rule_is_ambiguous() {
    let router = full_router();
    assert_eq!(
        resolve(&router, "/tracing/api/traces", &[("x-watchtower-module", "metrics")]),
        Err(Unroutable::Ambiguous)
    );
}

#[test]
fn marker_alone_routes_without_rewriting() {
    let router = full_router();
    let r = resolve(&router, "/custom/path?x=1", &[("x-watchtower-module", "logging")]).unwrap();
    assert_eq!(r.module, ModuleId::Logging);
    assert_eq!(r.forward_path, "/custom/path?x=1");
}

#[test]
fn unknown_marker_value_is_rejected() {
    let router = full_router();
    assert_eq!(
        resolve(&router, "/metrics", &[("x-watchtower-module", "profiling")]),
        Err(Unroutable::UnknownModule("profiling".into()))
    );
}

#[test]
fn unmatched_path_never_defaults() {
    let router = full_router();
    assert_eq!(resolve(&router, "/", &[]), Err(Unroutable::NoMatch));
    assert_eq!(resolve(&router, "/metricsz", &[]), Err(Unroutable::NoMatch));
}

#[test]
fn resolution_is_idempotent() {
    let router = full_router();
    let first = resolve(&router, "/metrics/federate", &[("host", "gw.local")]);
    for _ in 0..10 {
        assert_eq!(resolve(&router, "/metrics/federate", &[("host", "gw.local")]), first);
    }
}

#[test]
fn defaults_are_sensible() {
    let defaults = Defaults::default();
    assert!(defaults.forward_headers);
    assert!(defaults.proxy_headers);
    assert!(defaults.strip_hop_by_hop);
    assert!(!defaults.forward_credentials);
}
