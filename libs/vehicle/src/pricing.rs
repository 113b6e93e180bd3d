//! Price feed client.
//!
//! Given a charging deadline and energy need, the feed returns the
//! ordered slot sequence the optimizer computed. The response order is
//! meaningful and is preserved as-is.

use std::time::Duration;

use amp_plan::ChargeSlot;
use async_trait::async_trait;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GatewayError;
use crate::gateway::check_status;

/// Input to the price feed: what the vehicle needs and by when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub battery_percent: u8,
    pub energy_needed_kwh: f64,
    pub deadline: NaiveTime,
}

/// Price feed operations.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Fetch the ordered charge slot sequence for a request.
    async fn fetch_slots(&self, request: &PlanRequest) -> Result<Vec<ChargeSlot>, GatewayError>;
}

/// HTTP implementation of the price feed.
pub struct HttpPriceFeed {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpPriceFeed {
    /// Create a new price feed client with a per-call timeout.
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

#[derive(Debug, Deserialize)]
struct PlanResponse {
    slots: Vec<ChargeSlot>,
}

#[async_trait]
impl PriceFeed for HttpPriceFeed {
    async fn fetch_slots(&self, request: &PlanRequest) -> Result<Vec<ChargeSlot>, GatewayError> {
        let url = format!("{}/v1/plan", self.base_url);
        debug!(
            battery_percent = request.battery_percent,
            energy_needed_kwh = request.energy_needed_kwh,
            "Fetching charge plan"
        );

        let response = self
            .client
            .post(&url)
            .json(request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(GatewayError::from_reqwest)?;

        let body: PlanResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        debug!(slot_count = body.slots.len(), "Fetched charge plan");
        Ok(body.slots)
    }
}
