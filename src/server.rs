//! Axum server setup, shared application state, and graceful shutdown.
//!
//! [`AppState`] holds the reloadable [`LoadedConfig`] behind a `RwLock`
//! and the startup-time [`Gateway`]. [`build_router`] mounts `/health`
//! and sends everything else to the proxy core.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::ConfigVersion;
use crate::health::health_handler;
use crate::proxy::{self, Gateway, GatewaySnapshot};

/// The configuration currently serving requests.
#[derive(Debug)]
pub struct LoadedConfig {
    pub snapshot: Arc<GatewaySnapshot>,
    pub version: ConfigVersion,
    pub source_name: String,
    pub loaded_at: Instant,
}

impl LoadedConfig {
    #[must_use]
    pub fn new(snapshot: GatewaySnapshot, version: ConfigVersion, source_name: String) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
            version,
            source_name,
            loaded_at: Instant::now(),
        }
    }
}

#[derive(Debug)]
pub struct Stats {
    pub completed: AtomicU64,
    pub aborted: AtomicU64,
    pub config_reloads: AtomicU64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            completed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            config_reloads: AtomicU64::new(0),
        }
    }
}

pub type HttpsConnector =
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>;
pub type HttpClient = Client<HttpsConnector, http_body_util::Full<bytes::Bytes>>;

pub struct AppState {
    pub config: RwLock<LoadedConfig>,
    pub gateway: Gateway,
    pub start_time: Instant,
    /// Bound on each adapter health check made by `/health`.
    pub health_timeout: Duration,
}

impl AppState {
    #[must_use]
    pub fn new(loaded: LoadedConfig, gateway: Gateway) -> Self {
        Self {
            config: RwLock::new(loaded),
            gateway,
            start_time: Instant::now(),
            health_timeout: Duration::from_secs(2),
        }
    }

    /// Swap in a new snapshot. In-flight requests keep the one they took.
    pub async fn replace_config(&self, loaded: LoadedConfig) {
        *self.config.write().await = loaded;
        self.gateway
            .stats()
            .config_reloads
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub async fn snapshot(&self) -> Arc<GatewaySnapshot> {
        Arc::clone(&self.config.read().await.snapshot)
    }
}

#[must_use]
pub fn build_http_client() -> HttpClient {
    // Both `ring` and `aws-lc-rs` may be compiled in; pin `ring`.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(30))
        .build(https)
}

pub fn build_router(state: Arc<AppState>, max_body: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(proxy::forward_handler)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(max_body)),
        )
        .with_state(state)
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
