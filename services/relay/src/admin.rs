//! Admin API for operating the credential pool
//!
//! Merged into the main router. Endpoints mutate shared quota state, so the
//! listener should stay on a private address.
//!
//! Endpoints:
//! - GET  /admin/pool          pool status summary
//! - POST /admin/usage/reset   zero every usage counter for the month
//! - POST /admin/reconcile     overwrite counters with provider-reported usage
//! - POST /admin/rotate        advance the credential pool by one account

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tracing::info;

use crate::error::RelayError;
use crate::service::Relay;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    relay: Arc<Relay>,
}

impl AdminState {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }
}

/// Build the admin axum router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/pool", get(pool_status))
        .route("/admin/usage/reset", post(reset_usage))
        .route("/admin/reconcile", post(reconcile))
        .route("/admin/rotate", post(rotate))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// GET /admin/pool
///
/// Never exposes credential contents; file-backed accounts show their path.
async fn pool_status(State(state): State<AdminState>) -> Response {
    let (_, health) = state.relay.health();
    json_response(StatusCode::OK, health["pool"].clone())
}

/// POST /admin/usage/reset
async fn reset_usage(State(state): State<AdminState>) -> Result<Response, RelayError> {
    state.relay.reset_usage().await?;
    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({ "status": "reset" }),
    ))
}

/// POST /admin/reconcile
///
/// Returns 200 even when some accounts could not be queried; they are listed
/// under `failed_accounts` and keep their local counters.
async fn reconcile(State(state): State<AdminState>) -> Result<Response, RelayError> {
    let report = state.relay.reconcile().await?;
    info!(
        corrections = report.corrections.len(),
        failed = report.failed_accounts.len(),
        "manual reconciliation finished"
    );

    let corrections: Vec<serde_json::Value> = report
        .corrections
        .iter()
        .map(|c| {
            serde_json::json!({
                "account_id": c.account_id,
                "local": c.local,
                "provider": c.provider,
            })
        })
        .collect();
    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({
            "corrections": corrections,
            "failed_accounts": report.failed_accounts,
        }),
    ))
}

/// POST /admin/rotate
async fn rotate(State(state): State<AdminState>) -> Result<Response, RelayError> {
    let active = state.relay.rotate_account().await?;
    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({ "active_account": active }),
    ))
}
