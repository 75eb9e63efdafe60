//! `watchtower run`: start the gateway.
//!
//! Loads configuration, computes the enabled module set from profiles,
//! registers and health-checks the backends, then serves with graceful
//! shutdown while a background loop hot-reloads credentials, policy and
//! routing.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::TracingAuditSink;
use crate::backend::http::HttpBackend;
use crate::backend::BackendAdapter;
use crate::cli::RunArgs;
use crate::config::model::Config;
use crate::config::{self, ConfigSource, ConfigVersion, AUTH_SECRET_ENV};
use crate::error::WatchtowerError;
use crate::logging;
use crate::module;
use crate::proxy::pool::ConnectionPool;
use crate::proxy::{Gateway, GatewaySnapshot};
use crate::registry;
use crate::server::{self, AppState, LoadedConfig, Stats};

pub async fn execute(args: RunArgs) -> Result<(), WatchtowerError> {
    logging::init(&args.log_level, logging::resolve_format(args.pretty, args.json));

    let source = config::resolve_source(args.config.as_deref()).await?;
    let (config, version) = load(source.as_ref()).await?;

    let enabled = module::enabled_modules(&args.profiles, &config)?;
    if enabled.is_empty() {
        return Err(WatchtowerError::NoModulesEnabled {
            hint: "Pass --profile tracing|metrics|logging|all or list modules under 'enabled'."
                .into(),
        });
    }

    let client = server::build_http_client();
    let registry = registry::bootstrap(&config, &enabled, |id, module| {
        HttpBackend::new(id, module, client.clone())
            .map(|backend| Arc::new(backend) as Arc<dyn BackendAdapter>)
    })
    .await?;
    if registry.is_empty() {
        return Err(WatchtowerError::NoModulesEnabled {
            hint: "Every enabled module was optional and failed its startup health check.".into(),
        });
    }

    let pools: BTreeMap<_, _> = registry
        .modules()
        .filter_map(|id| {
            config
                .modules
                .get(id)
                .map(|m| (id, ConnectionPool::from_config(&m.pool)))
        })
        .collect();

    if config.auth.keys.is_empty() {
        tracing::warn!(
            env = AUTH_SECRET_ENV,
            "no signing keys configured; every request will be rejected"
        );
    }

    let modules: Vec<&str> = registry.modules().map(|m| m.as_str()).collect();
    let modules = modules.join(",");
    let policy_rules = config.total_policy_rules();

    let gateway = Gateway::new(
        registry,
        pools,
        Arc::new(TracingAuditSink),
        Arc::new(Stats::new()),
    );
    let loaded = LoadedConfig::new(
        GatewaySnapshot::from_config(Arc::new(config)),
        version,
        source.name().to_string(),
    );
    let mut state = AppState::new(loaded, gateway);
    state.health_timeout = Duration::from_millis(args.health_timeout);
    let state = Arc::new(state);

    // Flipped on shutdown to stop the refresh loop
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let refresh_state = state.clone();
    let poll_interval = args.poll_interval;
    let refresh_handle = tokio::spawn(async move {
        config_refresh_loop(refresh_state, source, poll_interval, shutdown_rx).await;
    });

    let router = server::build_router(state, args.max_body);
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(
        addr = %addr,
        modules = %modules,
        policy_rules,
        "watchtower started"
    );

    let graceful_shutdown = async move {
        server::shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    };

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(graceful_shutdown)
    .await?;

    if let Err(e) = refresh_handle.await {
        tracing::error!(error = %e, "config refresh task failed");
    }

    tracing::info!("watchtower stopped");
    Ok(())
}

/// Load from `source` and apply environment overrides.
pub async fn load(source: &dyn ConfigSource) -> Result<(Config, ConfigVersion), WatchtowerError> {
    let (mut config, version) = source.load().await?;
    config::apply_env_secret(&mut config, std::env::var(AUTH_SECRET_ENV).ok());
    Ok((config, version))
}

/// Reload `source` if it changed and swap the snapshot.
///
/// Module backends are fixed at startup; a changed `modules` or `enabled`
/// section is logged and otherwise ignored. Returns whether a new
/// snapshot was installed.
pub async fn refresh(
    state: &AppState,
    source: &dyn ConfigSource,
) -> Result<bool, WatchtowerError> {
    let (current_version, current) = {
        let loaded = state.config.read().await;
        (loaded.version.clone(), Arc::clone(&loaded.snapshot.config))
    };

    if !source.has_changed(&current_version).await? {
        return Ok(false);
    }

    tracing::info!("config change detected, reloading");
    let (config, version) = load(source).await?;

    if config.modules != current.modules || config.enabled != current.enabled {
        tracing::warn!("module configuration changed; restart to apply it");
    }

    let policy_rules = config.total_policy_rules();
    let snapshot = GatewaySnapshot::from_config(Arc::new(config));
    state
        .replace_config(LoadedConfig::new(
            snapshot,
            version,
            source.name().to_string(),
        ))
        .await;
    tracing::info!(policy_rules, "config reloaded");
    Ok(true)
}

async fn config_refresh_loop(
    state: Arc<AppState>,
    source: Box<dyn ConfigSource>,
    interval_secs: u64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    interval.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                tracing::debug!("config refresh loop shutting down");
                return;
            }
        }

        if let Err(e) = refresh(&state, source.as_ref()).await {
            tracing::error!(error = %e, "config reload failed, keeping current config");
        }
    }
}
