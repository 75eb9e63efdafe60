//! Header construction, forwarding, and hop-by-hop stripping.
//!
//! [`build_forwarded_headers`] clones the original client headers (when
//! forwarding is enabled), strips hop-by-hop headers and the caller's
//! credentials, adds proxy metadata (`X-Forwarded-For`, `X-Real-IP`,
//! `Via`, `X-Correlation-Id`) and the authenticated principal, and
//! applies the configured custom header rules. `Host` is left to the
//! backend adapter.

use std::sync::LazyLock;

use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::config::model::Defaults;

pub const PRINCIPAL_HEADER: &str = "x-watchtower-principal";

static HOP_BY_HOP: LazyLock<Vec<HeaderName>> = LazyLock::new(|| {
    [
        "connection",
        "keep-alive",
        "transfer-encoding",
        "te",
        "trailer",
        "upgrade",
        "proxy-authorization",
        "proxy-authenticate",
    ]
    .iter()
    .filter_map(|name| name.parse::<HeaderName>().ok())
    .collect()
});

/// Strip hop-by-hop headers from an upstream response before relaying it.
///
/// `content-length` is kept: the body is streamed through unchanged.
pub fn strip_response_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}

pub struct ForwardContext<'a> {
    pub client_ip: &'a str,
    pub correlation_id: &'a str,
    pub principal: &'a str,
}

pub fn build_forwarded_headers(
    original: &HeaderMap,
    ctx: &ForwardContext<'_>,
    defaults: &Defaults,
    marker_header: &str,
) -> HeaderMap {
    let mut headers = if defaults.forward_headers {
        original.clone()
    } else {
        HeaderMap::new()
    };

    if defaults.strip_hop_by_hop {
        for header_name in HOP_BY_HOP.iter() {
            headers.remove(header_name);
        }
    }

    // The body is re-sent as a full buffer, and the adapter owns Host.
    headers.remove(CONTENT_LENGTH);
    headers.remove(HOST);
    headers.remove(marker_header);
    // Never let a caller impersonate another principal.
    headers.remove(PRINCIPAL_HEADER);

    if !defaults.forward_credentials {
        headers.remove(AUTHORIZATION);
    }

    if defaults.proxy_headers {
        // X-Forwarded-For: append to chain
        let xff = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map_or_else(
                || ctx.client_ip.to_string(),
                |existing| format!("{existing}, {}", ctx.client_ip),
            );
        if let Ok(val) = HeaderValue::from_str(&xff) {
            headers.insert("x-forwarded-for", val);
        }

        // X-Real-IP (first IP in chain)
        let real_ip = xff.split(',').next().unwrap_or(ctx.client_ip).trim();
        if let Ok(val) = HeaderValue::from_str(real_ip) {
            headers.insert("x-real-ip", val);
        }

        if let Some(original_host) = original.get(HOST) {
            headers.insert("x-forwarded-host", original_host.clone());
        }

        headers.insert("via", HeaderValue::from_static("1.1 watchtower"));

        if let Ok(val) = HeaderValue::from_str(ctx.correlation_id) {
            headers.insert("x-correlation-id", val);
        }
    }

    if let Ok(val) = HeaderValue::from_str(ctx.principal) {
        headers.insert(PRINCIPAL_HEADER, val);
    }

    for (key, value) in &defaults.headers.add {
        match (key.parse::<HeaderName>(), HeaderValue::from_str(value)) {
            (Ok(name), Ok(val)) => {
                headers.insert(name, val);
            }
            _ => {
                tracing::warn!(header = %key, "invalid header name or value in defaults.headers.add, skipping");
            }
        }
    }

    for key in &defaults.headers.strip {
        if let Ok(name) = key.parse::<HeaderName>() {
            headers.remove(&name);
        }
    }

    headers
}
