//! Error taxonomy for gateway and price feed calls.

use thiserror::Error;

/// Errors from the vehicle gateway and price feed clients.
///
/// Every HTTP failure mode reduces to one of these so callers can apply
/// the matching recovery: one custodian refresh for `AuthExpired`, a
/// bounded wake for `VehicleUnreachable`, spacing or abort for
/// `RateLimited`, and plain failure for the rest.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The access token was rejected; a custodian refresh may fix it.
    #[error("authentication expired")]
    AuthExpired,

    /// The vehicle or gateway did not respond in time.
    #[error("vehicle unreachable: {0}")]
    VehicleUnreachable(String),

    /// The gateway is rate limiting us.
    #[error("gateway rate limited (retry after {retry_after_seconds:?}s)")]
    RateLimited { retry_after_seconds: Option<u64> },

    /// The gateway answered with an unexpected status.
    #[error("gateway request failed: {status} - {body}")]
    Api { status: u16, body: String },

    /// Transport-level failure not attributable to the vehicle.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Map a reqwest error into the taxonomy.
    ///
    /// Timeouts and connect failures count as the vehicle (or its
    /// gateway) being unreachable; everything else is transport.
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::VehicleUnreachable(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }

    /// Returns true for failures worth retrying on a later trigger.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::VehicleUnreachable(_) | Self::RateLimited { .. } | Self::Transport(_)
        )
    }
}
