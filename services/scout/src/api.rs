//! Scout HTTP surface.
//!
//! Two endpoints: `/healthz`, and `POST /v1/trigger` for running one
//! poll cycle on demand (home-automation hooks, manual testing). The
//! trigger shares the poller with the loop, including its refresh
//! cooldown; it does not bypass any gate the loop enforces.

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::poller::{PollOutcome, Poller};

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
}

/// Manual trigger request. Both fields are free-form labels carried
/// into the logs; the action performed is always one poll cycle.
#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    outcome: PollOutcome,
}

/// Create the scout router.
pub fn create_router(poller: Arc<Poller>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/trigger", post(trigger))
        .layer(TraceLayer::new_for_http())
        .with_state(poller)
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "scout".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Run one poll cycle now and report its outcome.
async fn trigger(
    State(poller): State<Arc<Poller>>,
    Json(request): Json<TriggerRequest>,
) -> impl IntoResponse {
    info!(
        trigger = request.trigger.as_deref().unwrap_or("manual"),
        action = request.action.as_deref().unwrap_or("poll"),
        "Manual poll trigger"
    );

    let outcome = poller.poll_once().await;
    Json(TriggerResponse { outcome })
}
