//! Data model shared by the scout and the worker.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the vehicle currently is, as far as the gateway can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationTag {
    Home,
    Away,
    Unknown,
}

/// Point-in-time read of vehicle telemetry.
///
/// Immutable once fetched; superseded by each new fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    pub online: bool,
    pub charge_ready: bool,
    pub location: LocationTag,
    pub battery_percent: u8,
    pub vin: String,
}

impl VehicleSnapshot {
    /// The trigger predicate: online, charge-ready, and at home.
    ///
    /// Scout uses this to decide whether to invoke the worker; the
    /// worker re-evaluates the same predicate on non-forced runs.
    pub fn ready_to_charge_at_home(&self) -> bool {
        self.online && self.charge_ready && self.location == LocationTag::Home
    }
}

/// Ownership tag on a vehicle schedule entry.
///
/// Only `Home` entries belong to this system. `Other` entries were
/// created by the user or by a special-session mechanism and are never
/// touched by routine reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryTag {
    Home,
    Other,
}

/// Vehicle-native schedule entry, as listed by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Opaque handle assigned by the gateway.
    pub id: String,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub current_amps: u16,
    pub tag: EntryTag,
}

/// Lifecycle of an out-of-band special charging session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    Complete,
}

/// An out-of-band charging session created outside routine reconciliation.
///
/// While one is `Active` the whole home schedule set is frozen, not just
/// overlapping slots: the session's own dynamically created entries are
/// indistinguishable from stale ones without this rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialSession {
    pub id: String,
    pub status: SessionStatus,
}

impl SpecialSession {
    /// Returns true if routine reconciliation must not touch schedules.
    pub fn freezes_schedules(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// Credentials for reaching the vehicle gateway.
///
/// Owned exclusively by the worker's token custodian; everything else
/// holds a read-only copy it is willing to discard and re-read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CredentialSet {
    /// Returns true if the access token has expired as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
