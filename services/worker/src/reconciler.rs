//! The schedule reconciliation state machine.
//!
//! A cycle walks `Idle → Woken? → Snapshot → PlanFetched →
//! FingerprintCompared → {NoChange | Rewriting} → Done`, with a
//! `Protected` short-circuit whenever a special charging session is
//! active. All three trigger sources (scout, nightly failsafe, weekly
//! emergency test) enter through [`Reconciler::run_cycle`] with the same
//! code path and differ only in their forcing flag.
//!
//! # Invariants
//!
//! - A cycle over an unchanged plan performs zero gateway mutations.
//! - During a rewrite, every add precedes every remove: the vehicle is
//!   never left without a home schedule.
//! - The stored fingerprint advances only after a fully successful
//!   rewrite, via compare-and-swap; any failure leaves it untouched so
//!   the next trigger retries the full comparison.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use amp_plan::{build_candidates, validate_slots, CurrentPolicy, PlanFingerprint};
use amp_store::{StateStore, StoreError};
use amp_vehicle::{
    EntryTag, GatewayError, PlanRequest, PriceFeed, ScheduleEntry, VehicleGateway,
    VehicleSnapshot,
};

use crate::custodian::TokenCustodian;

/// Result type for reconciliation cycles.
pub type CycleResult<T> = Result<T, CycleError>;

/// Errors that terminate a reconciliation cycle.
///
/// Each is handled within the invocation and reduced to a terminal
/// failure; recovery across invocations happens only via the next
/// scheduled trigger.
#[derive(Debug, Error)]
pub enum CycleError {
    /// Credentials were rejected by the gateway.
    #[error("authentication expired")]
    AuthExpired,

    /// The vehicle stayed unreachable after wake plus one retry.
    #[error("vehicle unreachable: {0}")]
    VehicleUnreachable(String),

    /// The gateway rate limited the rewrite; fingerprint left unchanged.
    #[error("gateway rate limited")]
    RateLimited,

    /// Adds succeeded but verification or removal failed. Stale entries
    /// stay behind for the next cycle; added entries are never reverted.
    #[error("partial rewrite: {detail}")]
    PartialRewrite { detail: String },

    /// The price feed returned an unusable plan.
    #[error("invalid plan: {0}")]
    InvalidPlan(#[from] amp_plan::PlanError),

    /// No credentials have ever been stored.
    #[error("no credentials in state store")]
    NoCredentials,

    /// State store failure (including a lost fingerprint CAS).
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    /// Other gateway or price feed failure.
    #[error("gateway error: {0}")]
    Gateway(String),
}

impl From<GatewayError> for CycleError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::AuthExpired => Self::AuthExpired,
            GatewayError::VehicleUnreachable(detail) => Self::VehicleUnreachable(detail),
            GatewayError::RateLimited { .. } => Self::RateLimited,
            other => Self::Gateway(other.to_string()),
        }
    }
}

/// Who asked for this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Scout,
    NightlyFailsafe,
    EmergencyTest,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scout => write!(f, "scout"),
            Self::NightlyFailsafe => write!(f, "nightly_failsafe"),
            Self::EmergencyTest => write!(f, "emergency_test"),
        }
    }
}

/// A reconciliation trigger: the source plus its forcing flag.
///
/// Forced runs bypass the readiness gate; they exist to catch cases
/// where readiness detection itself failed.
#[derive(Debug, Clone, Copy)]
pub struct TriggerRun {
    pub source: TriggerSource,
    pub force_full_check: bool,
}

impl TriggerRun {
    /// Scout-triggered run: readiness is re-verified.
    pub fn scout() -> Self {
        Self {
            source: TriggerSource::Scout,
            force_full_check: false,
        }
    }

    /// Nightly failsafe: forced, a backstop against missed arrivals.
    pub fn failsafe() -> Self {
        Self {
            source: TriggerSource::NightlyFailsafe,
            force_full_check: true,
        }
    }

    /// Weekly emergency test: forced, proves the pipeline is alive.
    pub fn emergency() -> Self {
        Self {
            source: TriggerSource::EmergencyTest,
            force_full_check: true,
        }
    }

    /// Explicit forced variant of an arbitrary source.
    pub fn forced(source: TriggerSource) -> Self {
        Self {
            source,
            force_full_check: true,
        }
    }
}

/// Terminal status of a successful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// The cycle ran to completion (with or without a rewrite).
    Completed,

    /// An active special session froze the schedule set.
    Protected,

    /// Condition not met on a non-forced run; nothing attempted.
    NotReady,
}

/// What the cycle did to the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTaken {
    None,
    ScheduleRewritten,
}

/// Outcome of a reconciliation cycle.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CycleOutcome {
    pub status: CycleStatus,
    pub action_taken: ActionTaken,
    pub fingerprint_changed: bool,
}

impl CycleOutcome {
    fn no_change() -> Self {
        Self {
            status: CycleStatus::Completed,
            action_taken: ActionTaken::None,
            fingerprint_changed: false,
        }
    }

    fn rewritten() -> Self {
        Self {
            status: CycleStatus::Completed,
            action_taken: ActionTaken::ScheduleRewritten,
            fingerprint_changed: true,
        }
    }

    fn protected() -> Self {
        Self {
            status: CycleStatus::Protected,
            action_taken: ActionTaken::None,
            fingerprint_changed: false,
        }
    }

    fn not_ready() -> Self {
        Self {
            status: CycleStatus::NotReady,
            action_taken: ActionTaken::None,
            fingerprint_changed: false,
        }
    }

    /// Short label recorded in the run-status record.
    pub fn summary(&self) -> &'static str {
        match (self.status, self.fingerprint_changed) {
            (CycleStatus::Protected, _) => "protected",
            (CycleStatus::NotReady, _) => "not_ready",
            (CycleStatus::Completed, true) => "schedule_rewritten",
            (CycleStatus::Completed, false) => "no_change",
        }
    }
}

/// Charging need parameters, from worker configuration.
#[derive(Debug, Clone)]
pub struct ChargingNeed {
    pub battery_capacity_kwh: f64,
    pub target_percent: u8,
    pub deadline: chrono::NaiveTime,
}

impl ChargingNeed {
    /// Energy required to reach the target from the current charge.
    fn energy_needed_kwh(&self, battery_percent: u8) -> f64 {
        let deficit = f64::from(self.target_percent) - f64::from(battery_percent);
        (self.battery_capacity_kwh * deficit / 100.0).max(0.0)
    }
}

/// Reconciler timing configuration.
///
/// Delays are injectable so tests can run with near-zero values.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How long to let the gateway register a wake before re-fetching.
    pub wake_settle_delay: Duration,

    /// Fixed delay between schedule mutations, for gateway rate limits.
    pub mutation_gap: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            wake_settle_delay: Duration::from_secs(5),
            mutation_gap: Duration::from_secs(3),
        }
    }
}

/// The schedule reconciler.
pub struct Reconciler {
    gateway: Arc<dyn VehicleGateway>,
    price_feed: Arc<dyn PriceFeed>,
    store: Arc<StateStore>,
    custodian: Arc<TokenCustodian>,
    policy: CurrentPolicy,
    need: ChargingNeed,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        gateway: Arc<dyn VehicleGateway>,
        price_feed: Arc<dyn PriceFeed>,
        store: Arc<StateStore>,
        custodian: Arc<TokenCustodian>,
        policy: CurrentPolicy,
        need: ChargingNeed,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            gateway,
            price_feed,
            store,
            custodian,
            policy,
            need,
            config,
        }
    }

    /// Run one reconciliation cycle and record its terminal status.
    ///
    /// A rejected access token gets exactly one custodian refresh and
    /// one full retry; idempotence makes the second pass safe even when
    /// the first died mid-rewrite.
    #[instrument(skip(self), fields(source = %run.source, force = run.force_full_check))]
    pub async fn run_cycle(&self, run: TriggerRun) -> CycleResult<CycleOutcome> {
        let mut result = self.cycle(run).await;

        if matches!(result, Err(CycleError::AuthExpired)) {
            match self.custodian.refresh().await {
                Ok(_) => {
                    info!("Credentials refreshed after rejection, retrying cycle");
                    result = self.cycle(run).await;
                }
                Err(e) => warn!(error = %e, "Refresh after rejected token failed"),
            }
        }

        // Best-effort status bookkeeping; never masks the cycle result.
        let record = match &result {
            Ok(outcome) => self.store.record_cycle_success(outcome.summary()),
            Err(e) => self.store.record_cycle_failure(&e.to_string()),
        };
        if let Err(e) = record {
            warn!(error = %e, "Failed to record cycle status");
        }

        match &result {
            Ok(outcome) => info!(
                status = ?outcome.status,
                fingerprint_changed = outcome.fingerprint_changed,
                "Cycle finished"
            ),
            Err(e) => warn!(error = %e, "Cycle failed"),
        }

        result
    }

    async fn cycle(&self, run: TriggerRun) -> CycleResult<CycleOutcome> {
        let creds = self
            .store
            .load_credentials()?
            .ok_or(CycleError::NoCredentials)?;
        let token = creds.access_token;

        // Wake-if-offline, unconditional on trigger source: any call to
        // the worker implies the caller believes action is warranted.
        let snapshot = self.ensure_online(&token).await?;

        // The special-session guard runs before any destructive step.
        if let Some(session) = self.gateway.active_special_session(&token).await? {
            if session.freezes_schedules() {
                info!(session_id = %session.id, "Active special session, schedules frozen");
                return Ok(CycleOutcome::protected());
            }
        }

        if !run.force_full_check && !snapshot.ready_to_charge_at_home() {
            debug!(
                online = snapshot.online,
                charge_ready = snapshot.charge_ready,
                location = ?snapshot.location,
                "Vehicle not ready, skipping cycle"
            );
            return Ok(CycleOutcome::not_ready());
        }

        // Plan fetch and fingerprint.
        let request = PlanRequest {
            battery_percent: snapshot.battery_percent,
            energy_needed_kwh: self.need.energy_needed_kwh(snapshot.battery_percent),
            deadline: self.need.deadline,
        };
        let slots = self.price_feed.fetch_slots(&request).await?;
        validate_slots(&slots)?;
        let fingerprint = PlanFingerprint::from_slots(&slots);

        // The core idempotence gate: an unchanged plan is a no-op.
        let previous = self.store.load_fingerprint()?;
        if previous.as_ref().map(|r| r.value.as_str()) == Some(fingerprint.as_str()) {
            debug!(fingerprint = %fingerprint, "Fingerprint unchanged, nothing to do");
            return Ok(CycleOutcome::no_change());
        }

        info!(
            old = previous.as_ref().map(|r| r.value.as_str()).unwrap_or("none"),
            new = %fingerprint,
            slot_count = slots.len(),
            "Plan changed, rewriting vehicle schedule"
        );
        self.rewrite(
            &token,
            &snapshot,
            &slots,
            &fingerprint,
            previous.map(|r| r.version),
        )
        .await?;

        Ok(CycleOutcome::rewritten())
    }

    /// Fetch a snapshot, waking the vehicle once if it is offline.
    async fn ensure_online(&self, token: &str) -> CycleResult<VehicleSnapshot> {
        let snapshot = self.gateway.fetch_snapshot(token).await?;
        if snapshot.online {
            return Ok(snapshot);
        }

        info!(vin = %snapshot.vin, "Vehicle offline, sending wake");
        self.gateway.wake(token).await?;
        tokio::time::sleep(self.config.wake_settle_delay).await;

        let snapshot = self.gateway.fetch_snapshot(token).await?;
        if !snapshot.online {
            return Err(CycleError::VehicleUnreachable(
                "vehicle stayed offline after wake".to_string(),
            ));
        }
        Ok(snapshot)
    }

    /// Rewrite the home schedule set: add, verify, nudge, then remove.
    async fn rewrite(
        &self,
        token: &str,
        snapshot: &VehicleSnapshot,
        slots: &[amp_plan::ChargeSlot],
        fingerprint: &PlanFingerprint,
        expected_version: Option<i64>,
    ) -> CycleResult<()> {
        let current = self.gateway.list_schedules(token).await?;
        let old_home: Vec<ScheduleEntry> = current
            .into_iter()
            .filter(|entry| entry.tag == EntryTag::Home)
            .collect();

        let candidates = build_candidates(slots, &self.policy);

        // Add before remove, so the vehicle always has some valid home
        // schedule programmed. Never remove old entries first.
        for (index, candidate) in candidates.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.mutation_gap).await;
            }
            let entry = self.gateway.add_schedule(token, candidate).await?;
            debug!(entry_id = %entry.id, start = %candidate.start_time, "Added schedule entry");
        }

        // Verify every candidate landed before touching old entries.
        let listed = self.gateway.list_schedules(token).await.map_err(|e| {
            CycleError::PartialRewrite {
                detail: format!("verification list failed: {e}"),
            }
        })?;
        for candidate in &candidates {
            let present = listed.iter().any(|entry| {
                entry.tag == EntryTag::Home
                    && entry.start_time == candidate.start_time
                    && entry.end_time == candidate.end_time
                    && entry.current_amps == candidate.current_amps
            });
            if !present {
                return Err(CycleError::PartialRewrite {
                    detail: format!(
                        "candidate {}-{} missing after add",
                        candidate.start_time, candidate.end_time
                    ),
                });
            }
        }

        // Close the timing gap when the new schedule should already be
        // charging. Best-effort: failure never aborts the cycle.
        if snapshot.charge_ready {
            if let Err(e) = self.gateway.start_charging(token).await {
                warn!(error = %e, "Start-charging nudge failed, continuing");
            }
        }

        for entry in &old_home {
            tokio::time::sleep(self.config.mutation_gap).await;
            self.gateway
                .remove_schedule(token, &entry.id)
                .await
                .map_err(|e| CycleError::PartialRewrite {
                    detail: format!("failed to remove stale entry {}: {e}", entry.id),
                })?;
            debug!(entry_id = %entry.id, "Removed stale schedule entry");
        }

        // Full success: replace the fingerprint atomically. A concurrent
        // cycle that moved it first wins; this one reports the conflict.
        self.store
            .swap_fingerprint(expected_version, fingerprint.as_str())?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_forcing_flags() {
        assert!(!TriggerRun::scout().force_full_check);
        assert!(TriggerRun::failsafe().force_full_check);
        assert!(TriggerRun::emergency().force_full_check);
        assert!(TriggerRun::forced(TriggerSource::Scout).force_full_check);
    }

    #[test]
    fn test_energy_need_derivation() {
        let need = ChargingNeed {
            battery_capacity_kwh: 75.0,
            target_percent: 80,
            deadline: chrono::NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
        };

        assert_eq!(need.energy_needed_kwh(40), 30.0);
        assert_eq!(need.energy_needed_kwh(80), 0.0);
        // Already above target clamps to zero.
        assert_eq!(need.energy_needed_kwh(95), 0.0);
    }

    #[test]
    fn test_outcome_summaries() {
        assert_eq!(CycleOutcome::no_change().summary(), "no_change");
        assert_eq!(CycleOutcome::rewritten().summary(), "schedule_rewritten");
        assert_eq!(CycleOutcome::protected().summary(), "protected");
        assert_eq!(CycleOutcome::not_ready().summary(), "not_ready");
    }

    #[test]
    fn test_reconciler_config_default() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.wake_settle_delay, Duration::from_secs(5));
        assert_eq!(config.mutation_gap, Duration::from_secs(3));
    }
}
