//! Worker API v1: cycle triggers, token refresh, and status.

use axum::{
    extract::State,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::reconciler::{TriggerRun, TriggerSource};
use crate::state::AppState;

/// Create the v1 routes. Mutation endpoints require the service token.
pub fn routes(state: AppState) -> Router<AppState> {
    let mutations = Router::new()
        .route("/run-cycle", post(run_cycle))
        .route("/run-midnight-wake", post(run_midnight_wake))
        .route("/refresh-tokens", post(refresh_tokens))
        .layer(middleware::from_fn_with_state(state, require_service_token));

    Router::new()
        .merge(mutations)
        .route("/worker-status", get(worker_status))
}

/// Bearer-token guard for mutation endpoints.
async fn require_service_token(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: middleware::Next,
) -> Result<axum::response::Response, ApiError> {
    let presented = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::unauthorized("missing_token", "Bearer token required"))?;

    if !state.verify_service_token(presented) {
        return Err(ApiError::unauthorized(
            "invalid_token",
            "Service token not recognized",
        ));
    }

    Ok(next.run(request).await)
}

#[derive(Debug, Default, Deserialize)]
struct RunCycleParams {
    /// Bypass the readiness gate (failsafe/emergency semantics).
    #[serde(default)]
    force: bool,

    /// Calling trigger: "scout" (default), "nightly_failsafe",
    /// or "emergency_test".
    source: Option<String>,
}

fn parse_source(raw: Option<&str>) -> Result<TriggerSource, ApiError> {
    match raw {
        None | Some("scout") => Ok(TriggerSource::Scout),
        Some("nightly_failsafe") => Ok(TriggerSource::NightlyFailsafe),
        Some("emergency_test") => Ok(TriggerSource::EmergencyTest),
        Some(other) => Err(ApiError::bad_request(
            "unknown_source",
            format!("unknown trigger source: {other}"),
        )),
    }
}

/// Run one reconciliation cycle. The body is optional; a bare POST is a
/// scout-style non-forced run.
async fn run_cycle(
    State(state): State<AppState>,
    params: Option<Json<RunCycleParams>>,
) -> Result<impl IntoResponse, ApiError> {
    let params = params.map(|Json(p)| p).unwrap_or_default();
    let source = parse_source(params.source.as_deref())?;
    let run = if params.force {
        TriggerRun::forced(source)
    } else {
        TriggerRun {
            source,
            force_full_check: false,
        }
    };

    let outcome = state.reconciler().run_cycle(run).await?;
    Ok(Json(outcome))
}

/// Nightly failsafe entry point: always forced.
async fn run_midnight_wake(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.reconciler().run_cycle(TriggerRun::failsafe()).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    status: String,
    expires_at: DateTime<Utc>,
}

/// Refresh the vehicle credentials on behalf of the scout.
async fn refresh_tokens(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let creds = state.custodian().refresh().await?;
    Ok(Json(RefreshResponse {
        status: "refreshed".to_string(),
        expires_at: creds.expires_at,
    }))
}

#[derive(Debug, Serialize)]
struct WorkerStatusResponse {
    last_success_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    last_cycle_status: Option<String>,
    fingerprint: Option<String>,
    fingerprint_version: Option<i64>,
    fingerprint_updated_at: Option<DateTime<Utc>>,
}

/// Observability endpoint: last fingerprint update and last error, so a
/// silently stuck pipeline is visible.
async fn worker_status(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let run_status = state
        .store()
        .load_run_status()
        .map_err(|e| ApiError::internal("store_unavailable", e.to_string()))?;
    let fingerprint = state
        .store()
        .load_fingerprint()
        .map_err(|e| ApiError::internal("store_unavailable", e.to_string()))?;

    Ok(Json(WorkerStatusResponse {
        last_success_at: run_status.last_success_at,
        last_error: run_status.last_error,
        last_error_at: run_status.last_error_at,
        last_cycle_status: run_status.last_cycle_status,
        fingerprint: fingerprint.as_ref().map(|r| r.value.clone()),
        fingerprint_version: fingerprint.as_ref().map(|r| r.version),
        fingerprint_updated_at: fingerprint.map(|r| r.updated_at),
    }))
}
