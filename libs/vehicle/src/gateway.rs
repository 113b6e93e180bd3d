//! Vehicle gateway client.
//!
//! The gateway fronts the vehicle vendor API: telemetry reads, wake,
//! and schedule mutation. It is remote, slow, and transiently flaky, so
//! every call carries an explicit timeout and maps onto the
//! [`GatewayError`] taxonomy.

use std::time::Duration;

use amp_plan::ScheduleCandidate;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::GatewayError;
use crate::types::{ScheduleEntry, SpecialSession, VehicleSnapshot};

/// Vehicle gateway operations.
///
/// The reconciler and the scout depend on this trait, never on the HTTP
/// client directly, so tests can substitute a recording fake.
#[async_trait]
pub trait VehicleGateway: Send + Sync {
    /// Fetch a point-in-time vehicle snapshot.
    async fn fetch_snapshot(&self, token: &str) -> Result<VehicleSnapshot, GatewayError>;

    /// Wake the vehicle. Returns once the gateway accepted the command,
    /// not once the vehicle is online.
    async fn wake(&self, token: &str) -> Result<(), GatewayError>;

    /// List all schedule entries currently programmed into the vehicle.
    async fn list_schedules(&self, token: &str) -> Result<Vec<ScheduleEntry>, GatewayError>;

    /// Submit a new schedule entry. The gateway assigns the handle.
    async fn add_schedule(
        &self,
        token: &str,
        candidate: &ScheduleCandidate,
    ) -> Result<ScheduleEntry, GatewayError>;

    /// Remove a schedule entry by its gateway-assigned handle.
    async fn remove_schedule(&self, token: &str, entry_id: &str) -> Result<(), GatewayError>;

    /// Query the current special charging session, if any.
    async fn active_special_session(
        &self,
        token: &str,
    ) -> Result<Option<SpecialSession>, GatewayError>;

    /// Best-effort "start charging now" nudge.
    async fn start_charging(&self, token: &str) -> Result<(), GatewayError>;
}

/// HTTP implementation of the vehicle gateway.
pub struct HttpVehicleGateway {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpVehicleGateway {
    /// Create a new gateway client with a per-call timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            timeout,
        })
    }
}

/// Reduce a non-success response to a `GatewayError`.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(GatewayError::AuthExpired);
    }

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_seconds = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        return Err(GatewayError::RateLimited {
            retry_after_seconds,
        });
    }

    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::Api {
        status: status.as_u16(),
        body,
    })
}

#[derive(Debug, Deserialize)]
struct ScheduleListResponse {
    entries: Vec<ScheduleEntry>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session: Option<SpecialSession>,
}

#[async_trait]
impl VehicleGateway for HttpVehicleGateway {
    async fn fetch_snapshot(&self, token: &str) -> Result<VehicleSnapshot, GatewayError> {
        let url = format!("{}/v1/vehicle/state", self.base_url);
        debug!(url = %url, "Fetching vehicle snapshot");

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(GatewayError::from_reqwest)?;

        check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }

    async fn wake(&self, token: &str) -> Result<(), GatewayError> {
        let url = format!("{}/v1/vehicle/wake", self.base_url);
        debug!(url = %url, "Sending wake command");

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(GatewayError::from_reqwest)?;

        check_status(response).await?;
        Ok(())
    }

    async fn list_schedules(&self, token: &str) -> Result<Vec<ScheduleEntry>, GatewayError> {
        let url = format!("{}/v1/vehicle/schedules", self.base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(GatewayError::from_reqwest)?;

        let body: ScheduleListResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        Ok(body.entries)
    }

    async fn add_schedule(
        &self,
        token: &str,
        candidate: &ScheduleCandidate,
    ) -> Result<ScheduleEntry, GatewayError> {
        let url = format!("{}/v1/vehicle/schedules", self.base_url);
        debug!(
            start = %candidate.start_time,
            end = %candidate.end_time,
            amps = candidate.current_amps,
            "Adding schedule entry"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(candidate)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(GatewayError::from_reqwest)?;

        check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }

    async fn remove_schedule(&self, token: &str, entry_id: &str) -> Result<(), GatewayError> {
        let url = format!("{}/v1/vehicle/schedules/{}", self.base_url, entry_id);
        debug!(entry_id = %entry_id, "Removing schedule entry");

        let response = self
            .client
            .delete(&url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(GatewayError::from_reqwest)?;

        check_status(response).await?;
        Ok(())
    }

    async fn active_special_session(
        &self,
        token: &str,
    ) -> Result<Option<SpecialSession>, GatewayError> {
        let url = format!("{}/v1/vehicle/charging-session", self.base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(GatewayError::from_reqwest)?;

        let body: SessionResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        Ok(body.session)
    }

    async fn start_charging(&self, token: &str) -> Result<(), GatewayError> {
        let url = format!("{}/v1/vehicle/charging/start", self.base_url);
        debug!(url = %url, "Nudging charging start");

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(GatewayError::from_reqwest)?;

        check_status(response).await?;
        Ok(())
    }
}
