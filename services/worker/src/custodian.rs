//! Token custodian: the single authority for credential refresh.
//!
//! Refresh tokens are typically single-use or narrowly rate limited
//! upstream, so duplicate concurrent refreshes risk invalidating each
//! other. The custodian serializes refreshes behind one lock and gates
//! them with a shared cooldown timestamp: concurrent callers within the
//! cooldown get a cooldown error instead of a duplicate attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use amp_store::{StateStore, StoreError};
use amp_vehicle::CredentialSet;

/// Minimum spacing between refresh attempts, successful or not.
pub const REFRESH_COOLDOWN: Duration = Duration::from_secs(60);

/// Timeout on the upstream refresh call.
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(45);

/// Errors from credential refresh.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// A refresh ran too recently; retry after the cooldown.
    #[error("refresh cooldown active, {remaining_secs}s remaining")]
    CooldownActive { remaining_secs: u64 },

    /// No credentials have ever been stored, so nothing to refresh with.
    #[error("no refresh token available")]
    NoRefreshToken,

    /// The upstream refresh call failed; the prior credentials remain
    /// valid until their own expiry. Transient: retry later.
    #[error("refresh request failed: {0}")]
    Upstream(String),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
    expires_in_secs: i64,
}

/// The token custodian.
pub struct TokenCustodian {
    client: reqwest::Client,
    auth_url: String,
    store: Arc<StateStore>,
    cooldown: Duration,
    timeout: Duration,
    last_attempt: tokio::sync::Mutex<Option<Instant>>,
}

impl TokenCustodian {
    /// Create a custodian with the default cooldown and timeout.
    pub fn new(auth_url: impl Into<String>, store: Arc<StateStore>) -> Result<Self, RefreshError> {
        Self::with_limits(auth_url, store, REFRESH_COOLDOWN, REFRESH_TIMEOUT)
    }

    /// Create a custodian with explicit limits (tests use short ones).
    pub fn with_limits(
        auth_url: impl Into<String>,
        store: Arc<StateStore>,
        cooldown: Duration,
        timeout: Duration,
    ) -> Result<Self, RefreshError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RefreshError::Upstream(e.to_string()))?;

        Ok(Self {
            client,
            auth_url: auth_url.into(),
            store,
            cooldown,
            timeout,
            last_attempt: tokio::sync::Mutex::new(None),
        })
    }

    /// Refresh the credentials and persist the new set.
    ///
    /// The lock is held across the upstream call: a second caller waits,
    /// then observes the cooldown rather than issuing a duplicate.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<CredentialSet, RefreshError> {
        let mut last_attempt = self.last_attempt.lock().await;

        if let Some(at) = *last_attempt {
            let elapsed = at.elapsed();
            if elapsed < self.cooldown {
                let remaining = self.cooldown - elapsed;
                return Err(RefreshError::CooldownActive {
                    remaining_secs: remaining.as_secs().max(1),
                });
            }
        }
        // The attempt counts against the cooldown whether it succeeds
        // or not.
        *last_attempt = Some(Instant::now());

        let current = self
            .store
            .load_credentials()?
            .ok_or(RefreshError::NoRefreshToken)?;

        let url = format!("{}/v1/token/refresh", self.auth_url);
        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest {
                refresh_token: &current.refresh_token,
            })
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RefreshError::Upstream(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Token refresh rejected");
            return Err(RefreshError::Upstream(format!("{status} - {body}")));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::Upstream(e.to_string()))?;

        let creds = CredentialSet {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at: Utc::now() + chrono::Duration::seconds(body.expires_in_secs),
        };
        self.store.put_credentials(&creds)?;

        info!(expires_at = %creds.expires_at, "Credentials refreshed");
        Ok(creds)
    }
}
