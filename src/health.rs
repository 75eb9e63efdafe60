//! `GET /health` endpoint handler.
//!
//! Returns a [`HealthResponse`] JSON payload with the build and uptime,
//! the loaded config's source and version, a live health check of every
//! registered module, and cumulative request counters. Module checks run
//! concurrently, each bounded by the state's health timeout. The overall
//! status is `degraded` as soon as one module fails its check.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::backend::BackendAdapter;
use crate::module::ModuleId;
use crate::proxy::Gateway;
use crate::server::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub build: BuildInfo,
    pub uptime_seconds: u64,
    pub config: ConfigHealth,
    pub modules: Vec<ModuleHealth>,
    pub stats: StatsResponse,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub git: String,
    pub profile: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigHealth {
    pub source: String,
    pub version: String,
    pub loaded_ago_seconds: u64,
    pub routing_rules: usize,
    pub policy_rules: usize,
    pub signing_keys: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModuleHealth {
    pub module: ModuleId,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub pool_in_use: usize,
    pub pool_capacity: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub requests_completed: u64,
    pub requests_aborted: u64,
    pub config_reloads: u64,
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (snapshot, source_name, version_str, loaded_ago) = {
        let loaded = state.config.read().await;
        (
            Arc::clone(&loaded.snapshot),
            loaded.source_name.clone(),
            loaded.version.short().to_string(),
            loaded.loaded_at.elapsed().as_secs(),
        )
    };

    let modules = check_modules(&state.gateway, state.health_timeout).await;
    let status = if modules.iter().all(|m| m.healthy) {
        "healthy"
    } else {
        "degraded"
    };

    let stats = state.gateway.stats();
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        build: BuildInfo {
            git: env!("WATCHTOWER_GIT_SHORT").to_string(),
            profile: env!("WATCHTOWER_BUILD_PROFILE").to_string(),
        },
        uptime_seconds: state.start_time.elapsed().as_secs(),
        config: ConfigHealth {
            source: source_name,
            version: version_str,
            loaded_ago_seconds: loaded_ago,
            routing_rules: snapshot.config.routing.rules.len(),
            policy_rules: snapshot.policy.rules().len(),
            signing_keys: snapshot.validator.key_count(),
        },
        modules,
        stats: StatsResponse {
            requests_completed: stats.completed.load(Ordering::Relaxed),
            requests_aborted: stats.aborted.load(Ordering::Relaxed),
            config_reloads: stats.config_reloads.load(Ordering::Relaxed),
        },
    })
}

/// Probe every registered module concurrently.
pub async fn check_modules(gateway: &Gateway, timeout: Duration) -> Vec<ModuleHealth> {
    let checks = gateway.registry().iter().map(|(id, adapter)| async move {
        let error = probe(adapter.as_ref(), timeout).await.err();
        let (pool_in_use, pool_capacity) = gateway
            .pool(id)
            .map_or((0, 0), |p| (p.in_use(), p.capacity()));
        ModuleHealth {
            module: id,
            healthy: error.is_none(),
            error,
            pool_in_use,
            pool_capacity,
        }
    });
    join_all(checks).await
}

async fn probe(adapter: &dyn BackendAdapter, timeout: Duration) -> Result<(), String> {
    match tokio::time::timeout(timeout, adapter.health_check()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!(
            "health check timed out after {}ms",
            timeout.as_millis()
        )),
    }
}
