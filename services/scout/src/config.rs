//! Configuration for the scout.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Scout configuration, loaded from `AMP_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,

    /// Vehicle gateway base URL.
    pub gateway_url: String,

    /// Worker base URL for trigger and refresh calls.
    pub worker_url: String,

    /// Bearer token presented to the worker's mutation endpoints.
    pub service_token: String,

    /// Path to the worker's SQLite state store, opened read-only.
    pub state_path: PathBuf,

    /// Poll cadence.
    pub poll_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("AMP_SCOUT_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8091".to_string())
            .parse()
            .context("invalid AMP_SCOUT_LISTEN_ADDR")?;

        let gateway_url = std::env::var("AMP_GATEWAY_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:9920".to_string());

        let worker_url =
            std::env::var("AMP_WORKER_URL").unwrap_or_else(|_| "http://127.0.0.1:8090".to_string());

        let service_token =
            std::env::var("AMP_SERVICE_TOKEN").context("AMP_SERVICE_TOKEN is required")?;

        let state_path = std::env::var("AMP_STATE_PATH")
            .unwrap_or_else(|_| "/var/lib/ampflow/state.db".to_string())
            .into();

        let poll_interval_secs: u64 = std::env::var("AMP_POLL_INTERVAL_SECS")
            .ok()
            .map(|s| s.parse().context("invalid AMP_POLL_INTERVAL_SECS"))
            .transpose()?
            .unwrap_or(900);

        let log_level = std::env::var("AMP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            gateway_url,
            worker_url,
            service_token,
            state_path,
            poll_interval: Duration::from_secs(poll_interval_secs),
            log_level,
        })
    }
}
