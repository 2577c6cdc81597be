//! Translation Relay
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of translation accounts and bot identities
//! 2. Serves translations on the active account, counting characters per month
//! 3. Rotates accounts at the per-account threshold
//! 4. Exits with code 75 when the whole pool is exhausted so a supervisor
//!    restarts it under the next identity

mod admin;
mod config;
mod error;
mod metrics;
mod service;

#[cfg(test)]
mod test_support;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use provider::{HttpTranslatorFactory, HttpUsageMonitor, UsageMonitor};
use quota_pool::{CredentialPool, IdentityPool, RotationSignal, UsageLedger, spawn_reconcile_task};
use serde::Deserialize;
use state_store::{FileStateStore, StateStore};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::config::Config;
use crate::error::RelayError;
use crate::service::Relay;

/// Time allowed for in-flight requests to finish after shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// `EX_TEMPFAIL`: deliberate restart for an identity rotation.
const EXIT_ROTATION: u8 = 75;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    relay: Arc<Relay>,
    prometheus: PrometheusHandle,
}

/// Why the run loop returned.
#[derive(Debug)]
enum Shutdown {
    Signal,
    Rotation(RotationSignal),
}

/// Build the axum router with all routes and shared state.
///
/// The concurrency limit covers the admin routes too.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let admin = admin::build_admin_router(AdminState::new(state.relay.clone()));
    Router::new()
        .route("/translate", post(translate_handler))
        .route("/usage", get(usage_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(admin)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    match run().await {
        Ok(Shutdown::Signal) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Ok(Shutdown::Rotation(signal)) => {
            warn!(
                from_index = signal.from_index,
                to_index = signal.to_index,
                exit_code = EXIT_ROTATION,
                "exiting for identity rotation"
            );
            ExitCode::from(EXIT_ROTATION)
        }
        Err(e) => {
            let message = format!("{e:#}");
            error!(error = %message, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<Shutdown> {
    info!("starting translation-relay");

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        accounts = config.pool.accounts.len(),
        identities = config.identity.tokens.len(),
        state_path = %config.state.path.display(),
        "configuration loaded"
    );

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder()?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.server.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;

    let store: Arc<dyn StateStore> = Arc::new(
        FileStateStore::load(config.state.path.clone())
            .await
            .with_context(|| format!("failed to open state file {}", config.state.path.display()))?,
    );
    let factory = Arc::new(HttpTranslatorFactory::new(
        http.clone(),
        config.provider.translate_url.clone(),
    ));
    let monitor: Arc<dyn UsageMonitor> = Arc::new(HttpUsageMonitor::new(
        http,
        config.provider.monitoring_url.clone(),
    ));

    let pool = CredentialPool::new(config.pool.accounts.clone(), store.clone(), factory)?;
    pool.initialize()
        .await
        .context("failed to initialize credential pool")?;
    if !pool.is_initialized() {
        warn!(
            account_id = %pool.get_active_account().id,
            "active account has no working client, translations fail until it rotates"
        );
    }

    let ledger = Arc::new(UsageLedger::new(
        Arc::new(pool),
        store.clone(),
        config.quota_limits(),
    ));
    ledger
        .initialize()
        .await
        .context("failed to load usage ledger")?;

    let identity = IdentityPool::new(config.identities(), store, ledger.clone())?
        .with_reset_usage_on_rotation(config.identity.reset_usage_on_rotation);
    identity
        .initialize()
        .await
        .context("failed to initialize identity pool")?;
    info!(active_index = identity.active_index(), "identity selected");

    let (rotation_tx, mut rotation_rx) = mpsc::channel(1);
    let relay = Arc::new(Relay::new(
        ledger.clone(),
        Arc::new(identity),
        monitor.clone(),
        rotation_tx,
    ));

    // An identity whose pool was exhausted before this start rotates now
    if let Some(signal) = relay.check_identity().await {
        return Ok(Shutdown::Rotation(signal));
    }

    let reconcile = spawn_reconcile_task(
        ledger,
        monitor,
        Duration::from_secs(config.quota.reconcile_interval_secs),
    );

    let app = build_router(
        AppState {
            relay,
            prometheus,
        },
        config.server.max_connections,
    );

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when shutdown begins, not when the server
    // starts: notify the server to drain, then race the drain against it.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let shutdown = tokio::select! {
        _ = shutdown_signal() => Shutdown::Signal,
        Some(signal) = rotation_rx.recv() => {
            info!(%signal, "identity rotation requested, shutting down");
            Shutdown::Rotation(signal)
        }
    };

    reconcile.abort();
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    Ok(shutdown)
}

#[derive(Deserialize)]
struct TranslateRequest {
    text: String,
    target: String,
    #[serde(default)]
    source: Option<String>,
}

/// POST /translate
async fn translate_handler(
    State(state): State<AppState>,
    payload: Result<Json<TranslateRequest>, JsonRejection>,
) -> Response {
    let start = Instant::now();
    let result = match payload {
        Ok(Json(body)) => {
            state
                .relay
                .translate(&body.text, &body.target, body.source.as_deref())
                .await
        }
        Err(rejection) => Err(RelayError::InvalidRequest(rejection.body_text())),
    };
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(translation) => {
            metrics::record_translation("ok", elapsed);
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "translated_text": translation.text,
                    "detected_source_language": translation.detected_source_language,
                })),
            )
                .into_response()
        }
        Err(e) => {
            metrics::record_translation(e.error_type(), elapsed);
            e.into_response()
        }
    }
}

/// GET /usage
async fn usage_handler(State(state): State<AppState>) -> Response {
    match state.relay.usage().await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Health endpoint: returns 200 when the active account has a working
/// client, 503 when degraded.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (healthy, body) = state.relay.health();
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
///
/// A handler that cannot be installed never fires; the other one still can.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
