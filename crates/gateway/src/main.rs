use std::sync::Arc;

use anyhow::Context;
use axum::http::HeaderValue;
use clap::Parser;
use dd_backend::SandboxBackend;
use dd_domain::config::{BackendKind, Config, ConfigSeverity};
use dd_gateway::api;
use dd_gateway::cli::{Cli, Command, ConfigCommand};
use dd_gateway::lifecycle::{reaper, reconcile, LifecycleManager};
use dd_gateway::proxy::subdomain::subdomain_middleware;
use dd_gateway::state::AppState;
use dd_gateway::tunnel::registry::TunnelRegistry;
use dd_store::{PgStore, Store};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Config::load().context("loading config")?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = Config::load().context("loading config")?;
            if !dd_gateway::cli::config::validate(&config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = Config::load().context("loading config")?;
            dd_gateway::cli::config::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("drydock {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,dd_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("drydock starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Database ─────────────────────────────────────────────────────
    let pg = Arc::new(
        PgStore::connect(&config.database)
            .await
            .context("connecting to database")?,
    );
    let store: Arc<dyn Store> = pg.clone();

    // ── Container backend ────────────────────────────────────────────
    let backend: Arc<dyn SandboxBackend> = match config.backend.kind {
        BackendKind::Docker => Arc::new(
            dd_backend::docker::DockerBackend::new(
                config.backend.clone(),
                config.limits.clone(),
            )
            .context("docker backend")?,
        ),
        BackendKind::Kubernetes => Arc::new(
            dd_backend::kube::KubeBackend::new(config.backend.clone(), config.limits.clone())
                .await
                .context("kubernetes backend")?,
        ),
    };
    tracing::info!(kind = ?config.backend.kind, "container backend ready");

    // ── Upstream credential (resolved once, never logged) ────────────
    let upstream_key: Option<Arc<str>> = match std::env::var(&config.upstream.api_key_env) {
        Ok(key) if !key.is_empty() => {
            tracing::info!(env_var = %config.upstream.api_key_env, "upstream credential loaded");
            Some(Arc::from(key.as_str()))
        }
        _ => {
            tracing::warn!(
                env_var = %config.upstream.api_key_env,
                "upstream credential unset — the API proxy will refuse requests"
            );
            None
        }
    };

    // ── Core components ──────────────────────────────────────────────
    let tunnels = Arc::new(TunnelRegistry::new());
    let lifecycle = Arc::new(LifecycleManager::new(
        store.clone(),
        backend.clone(),
        tunnels.clone(),
        config.clone(),
    ));
    let http = reqwest::Client::builder()
        .read_timeout(std::time::Duration::from_secs(
            config.upstream.idle_read_timeout_secs,
        ))
        .build()
        .context("building proxy http client")?;

    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        backend,
        lifecycle: lifecycle.clone(),
        tunnels: tunnels.clone(),
        http,
        upstream_key,
    };

    // ── Post-crash reconciliation ────────────────────────────────────
    {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            reconcile::run(&lifecycle).await;
            tracing::info!("startup reconciliation complete");
        });
    }

    // ── Idle reaper ──────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let reaper_handle = reaper::spawn(lifecycle.clone(), shutdown.clone());

    // ── Router ───────────────────────────────────────────────────────
    let cors = build_cors_layer(&config);
    let max_concurrent = config.server.max_concurrent_requests;
    let governor_layer = config.server.rate_limit.as_ref().map(|rl| {
        use tower_governor::governor::GovernorConfigBuilder;
        use tower_governor::GovernorLayer;

        let gov_config = GovernorConfigBuilder::default()
            .per_second(rl.requests_per_second)
            .burst_size(rl.burst_size)
            .finish()
            .expect("rate_limit: requests_per_second and burst_size must be > 0");
        tracing::info!(
            requests_per_second = rl.requests_per_second,
            burst_size = rl.burst_size,
            "per-IP rate limiting enabled"
        );
        GovernorLayer { config: Arc::new(gov_config) }
    });

    let router = api::router()
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            subdomain_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent));
    let app = if let Some(governor) = governor_layer {
        router.layer(governor).with_state(state)
    } else {
        router.with_state(state)
    };

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, base_domain = %config.routing.base_domain, "drydock listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server error")?;

    // ── Graceful shutdown: workers, tunnels, then the pool last ─────
    tracing::info!("shutting down");
    shutdown.cancel();
    let _ = reaper_handle.await;
    tunnels.drain();
    pg.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// CORS: the web frontend lives on the base domain; any configured extra
/// origins are added verbatim.
fn build_cors_layer(config: &Config) -> CorsLayer {
    use axum::http::{header, Method};

    let mut origins: Vec<HeaderValue> = Vec::new();
    let base = format!(
        "{}://{}",
        config.routing.base_scheme, config.routing.base_domain
    );
    if let Ok(value) = base.parse() {
        origins.push(value);
    }
    for origin in &config.server.cors.allowed_origins {
        match origin.parse() {
            Ok(value) => origins.push(value),
            Err(_) => tracing::warn!(origin = %origin, "invalid CORS origin, skipping"),
        }
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}
