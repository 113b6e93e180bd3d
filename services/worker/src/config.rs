//! Configuration for the reconciliation worker.

use std::net::SocketAddr;
use std::path::PathBuf;

use amp_plan::CurrentPolicy;
use anyhow::{Context, Result};
use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;

/// Worker configuration, loaded from `AMP_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,

    /// Vehicle gateway base URL.
    pub gateway_url: String,

    /// Price feed base URL.
    pub price_feed_url: String,

    /// Token refresh endpoint base URL.
    pub auth_url: String,

    /// Path to the shared SQLite state store.
    pub state_path: PathBuf,

    /// Bearer token callers must present on mutation endpoints.
    pub service_token: String,

    /// Local time zone anchoring the failsafe/emergency cadences.
    pub time_zone: Tz,

    /// Nightly failsafe wall-clock time.
    pub failsafe_time: NaiveTime,

    /// Weekly emergency-test weekday and wall-clock time.
    pub emergency_weekday: Weekday,
    pub emergency_time: NaiveTime,

    /// Battery capacity used to derive the energy need.
    pub battery_capacity_kwh: f64,

    /// Charge target as a battery percentage.
    pub target_percent: u8,

    /// Deadline passed to the price feed.
    pub charge_deadline: NaiveTime,

    /// Price-tier to amperage mapping.
    pub current_policy: CurrentPolicy,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("AMP_WORKER_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8090".to_string())
            .parse()
            .context("invalid AMP_WORKER_LISTEN_ADDR")?;

        let gateway_url = std::env::var("AMP_GATEWAY_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:9920".to_string());

        let price_feed_url = std::env::var("AMP_PRICE_FEED_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:9921".to_string());

        let auth_url =
            std::env::var("AMP_AUTH_URL").unwrap_or_else(|_| gateway_url.clone());

        let state_path = std::env::var("AMP_STATE_PATH")
            .unwrap_or_else(|_| "/var/lib/ampflow/state.db".to_string())
            .into();

        let service_token =
            std::env::var("AMP_SERVICE_TOKEN").context("AMP_SERVICE_TOKEN is required")?;

        let time_zone = std::env::var("AMP_TIME_ZONE")
            .unwrap_or_else(|_| "Europe/Amsterdam".to_string())
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid AMP_TIME_ZONE: {e}"))?;

        let failsafe_time = parse_time_var("AMP_FAILSAFE_TIME", "03:30")?;

        let emergency_weekday = std::env::var("AMP_EMERGENCY_WEEKDAY")
            .unwrap_or_else(|_| "sunday".to_string())
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid AMP_EMERGENCY_WEEKDAY"))?;

        let emergency_time = parse_time_var("AMP_EMERGENCY_TIME", "12:00")?;

        let battery_capacity_kwh = std::env::var("AMP_BATTERY_CAPACITY_KWH")
            .ok()
            .map(|s| s.parse().context("invalid AMP_BATTERY_CAPACITY_KWH"))
            .transpose()?
            .unwrap_or(75.0);

        let target_percent = std::env::var("AMP_TARGET_PERCENT")
            .ok()
            .map(|s| s.parse().context("invalid AMP_TARGET_PERCENT"))
            .transpose()?
            .unwrap_or(80);

        let charge_deadline = parse_time_var("AMP_CHARGE_DEADLINE", "07:00")?;

        let current_policy = match std::env::var("AMP_CURRENT_TIERS") {
            Ok(json) => serde_json::from_str(&json).context("invalid AMP_CURRENT_TIERS")?,
            Err(_) => CurrentPolicy::default(),
        };

        let log_level = std::env::var("AMP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            gateway_url,
            price_feed_url,
            auth_url,
            state_path,
            service_token,
            time_zone,
            failsafe_time,
            emergency_weekday,
            emergency_time,
            battery_capacity_kwh,
            target_percent,
            charge_deadline,
            current_policy,
            log_level,
        })
    }
}

fn parse_time_var(name: &str, default: &str) -> Result<NaiveTime> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    NaiveTime::parse_from_str(&raw, "%H:%M").with_context(|| format!("invalid {name} (HH:MM)"))
}
