//! `watchtower health`: check the health of a running instance.
//!
//! Sends a `GET /health` request to the specified URL and displays
//! the response as formatted text or raw JSON. A `degraded` instance is
//! printed with its failing modules and still exits zero; only a failed
//! request or non-2xx status is an error.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};

use crate::cli::HealthArgs;
use crate::error::WatchtowerError;
use crate::health::HealthResponse;
use crate::server::build_http_client;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn execute(args: HealthArgs) -> Result<(), WatchtowerError> {
    let body = fetch(&format!("{}/health", args.url.trim_end_matches('/'))).await?;

    if args.json {
        println!("{}", String::from_utf8_lossy(&body));
        return Ok(());
    }

    let body_str = String::from_utf8_lossy(&body);
    match serde_json::from_str::<HealthResponse>(&body_str) {
        Ok(health) => print_report(&args.url, &health),
        Err(e) => {
            eprintln!("Failed to parse health response: {e}");
            println!("{body_str}");
        }
    }

    Ok(())
}

fn print_report(url: &str, health: &HealthResponse) {
    let mark = if health.status == "healthy" {
        "\u{2713}"
    } else {
        "\u{26a0}"
    };
    println!("{mark} watchtower is {} ({url})", health.status);
    println!(
        "  build:          v{} ({}, {})",
        health.version, health.build.git, health.build.profile
    );
    println!("  uptime:         {}", format_uptime(health.uptime_seconds));
    println!("  config source:  {}", health.config.source);
    println!(
        "  config version: {} (loaded {}s ago)",
        health.config.version, health.config.loaded_ago_seconds
    );
    println!(
        "  policy:         {} rules, {} routing rules, {} keys",
        health.config.policy_rules, health.config.routing_rules, health.config.signing_keys
    );
    for module in &health.modules {
        let state = module.error.as_deref().unwrap_or("ok");
        println!(
            "  {:<15} {state} (pool {}/{})",
            format!("{}:", module.module),
            module.pool_in_use,
            module.pool_capacity
        );
    }
    println!(
        "  requests:       {} completed, {} aborted, {} config reloads",
        health.stats.requests_completed, health.stats.requests_aborted, health.stats.config_reloads
    );
}

/// GET `url` over the gateway's own client (so `https` instances work)
/// and return the body of a 2xx response.
async fn fetch(url: &str) -> Result<Bytes, WatchtowerError> {
    let uri: hyper::Uri = url
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| WatchtowerError::UriParse {
            source: Box::new(e),
        })?;
    let req = hyper::Request::get(uri)
        .body(Full::new(Bytes::new()))
        .map_err(|e| WatchtowerError::HttpRequest {
            source: Box::new(e),
        })?;

    let response = tokio::time::timeout(REQUEST_TIMEOUT, build_http_client().request(req))
        .await
        .map_err(|_| WatchtowerError::HttpRequest {
            source: format!("health check timed out after {}s", REQUEST_TIMEOUT.as_secs()).into(),
        })?
        .map_err(|e| WatchtowerError::HttpRequest {
            source: Box::new(e),
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(WatchtowerError::HealthCheckFailed(status));
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| WatchtowerError::HttpRequest {
            source: Box::new(e),
        })?;
    Ok(body.to_bytes())
}

fn format_uptime(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {secs}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}
