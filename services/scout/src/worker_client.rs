//! Worker API client for the scout.
//!
//! Two calls only: the run-cycle trigger and the synchronous token
//! refresh. Both carry the service bearer token and an explicit
//! per-call timeout.

use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

/// How long the scout waits on a trigger call. The worker runs the
/// cycle inline and a wake plus rewrite can outlast this; a timeout
/// after delivery is not a trigger failure.
const TRIGGER_TIMEOUT: Duration = Duration::from_secs(30);

/// Refresh is synchronous by design; the scout waits for the outcome.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Serialize)]
struct RunCycleRequest {
    force: bool,
    source: &'static str,
}

/// Worker API client.
pub struct WorkerClient {
    client: reqwest::Client,
    base_url: String,
    service_token: String,
    trigger_timeout: Duration,
}

impl WorkerClient {
    /// Create a new worker client.
    pub fn new(base_url: impl Into<String>, service_token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            service_token: service_token.into(),
            trigger_timeout: TRIGGER_TIMEOUT,
        })
    }

    #[doc(hidden)]
    pub fn with_trigger_timeout(mut self, timeout: Duration) -> Self {
        self.trigger_timeout = timeout;
        self
    }

    /// Ask the worker to run one reconciliation cycle.
    ///
    /// Only transport success or failure is interpreted; the cycle
    /// outcome belongs to the worker.
    pub async fn trigger_run_cycle(&self) -> Result<()> {
        let url = format!("{}/v1/run-cycle", self.base_url);
        debug!(url = %url, "Triggering worker run-cycle");

        let result = self
            .client
            .post(&url)
            .bearer_auth(&self.service_token)
            .json(&RunCycleRequest {
                force: false,
                source: "scout",
            })
            .timeout(self.trigger_timeout)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            // The request was delivered; a slow cycle is not a failed
            // trigger. Connect and transport errors still are.
            Err(e) if e.is_timeout() => {
                debug!("Run-cycle trigger still in flight at timeout");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("run-cycle trigger failed: {status} - {body}");
        }

        Ok(())
    }

    /// Ask the worker to refresh the shared credentials now.
    pub async fn refresh_tokens(&self) -> Result<()> {
        let url = format!("{}/v1/refresh-tokens", self.base_url);
        debug!(url = %url, "Requesting token refresh");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.service_token)
            .timeout(REFRESH_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("token refresh failed: {status} - {body}");
        }

        Ok(())
    }
}
