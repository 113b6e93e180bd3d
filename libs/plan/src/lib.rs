//! Charge plan primitives.
//!
//! This library models the output of the price feed and its translation
//! into vehicle schedule candidates. Key concepts:
//!
//! - **Charge slot**: A time window with an energy budget and a price,
//!   as computed by the external price optimizer.
//! - **Fingerprint**: A deterministic content hash over an ordered slot
//!   sequence, used to detect "no meaningful change" and skip rewrites.
//! - **Current policy**: The monotonic price-tier to amperage mapping.
//!
//! # Invariants
//!
//! - Fingerprints cover slot times, energy, and price, never amperage,
//!   which is a derived value and must not trigger a rewrite on its own.
//! - Slot order is significant: the same slots in a different order hash
//!   differently, since sequencing matters at midnight rollover.
//! - Tier mappings are monotonic: a higher price never maps to more amps.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Plan model errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A slot carried a negative energy or price value.
    #[error("invalid slot at index {index}: {reason}")]
    InvalidSlot { index: usize, reason: String },

    /// Tier policy is empty.
    #[error("current policy requires at least one tier")]
    EmptyPolicy,

    /// Tier policy is not monotonic.
    #[error("current policy is not monotonic: {0}")]
    NonMonotonicPolicy(String),
}

/// A single charging window produced by the price feed.
///
/// Slots are wall-clock windows; `end_time < start_time` signals a
/// rollover past midnight into the next day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeSlot {
    /// Window start (local wall clock).
    pub start_time: NaiveTime,

    /// Window end; earlier than `start_time` means next-day rollover.
    pub end_time: NaiveTime,

    /// Energy to deliver in this window, kWh.
    pub energy_kwh: f64,

    /// Price for this window, per kWh.
    pub price_per_kwh: f64,
}

impl ChargeSlot {
    /// Returns true if this slot rolls over past midnight.
    pub fn crosses_midnight(&self) -> bool {
        self.end_time < self.start_time
    }
}

/// Validate a slot sequence received from the price feed.
pub fn validate_slots(slots: &[ChargeSlot]) -> Result<(), PlanError> {
    for (index, slot) in slots.iter().enumerate() {
        if slot.energy_kwh < 0.0 || !slot.energy_kwh.is_finite() {
            return Err(PlanError::InvalidSlot {
                index,
                reason: format!("energy_kwh {} out of range", slot.energy_kwh),
            });
        }
        if slot.price_per_kwh < 0.0 || !slot.price_per_kwh.is_finite() {
            return Err(PlanError::InvalidSlot {
                index,
                reason: format!("price_per_kwh {} out of range", slot.price_per_kwh),
            });
        }
    }
    Ok(())
}

/// A plan fingerprint for deterministic comparison.
///
/// Covers the ordered slot list (times, energy, price). Amperage is
/// deliberately excluded: it is a deterministic function of price tier,
/// and recomputing it must not look like a plan change.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlanFingerprint(String);

impl PlanFingerprint {
    /// Compute the fingerprint of an ordered slot sequence.
    pub fn from_slots(slots: &[ChargeSlot]) -> Self {
        let mut hasher = Sha256::new();
        for slot in slots {
            hasher.update(
                format!(
                    "{}|{}|{}|{}\n",
                    slot.start_time.format("%H:%M"),
                    slot.end_time.format("%H:%M"),
                    slot.energy_kwh,
                    slot.price_per_kwh,
                )
                .as_bytes(),
            );
        }
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Reconstruct a fingerprint from its stored string form.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the fingerprint string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PlanFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One price tier of the current policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrentTier {
    /// Inclusive upper price bound for this tier.
    pub max_price: f64,

    /// Charging current assigned to prices at or below the bound.
    pub amps: u16,
}

/// Monotonic price-tier to charging-current mapping.
///
/// Tiers are ordered by ascending price bound; cheaper electricity maps
/// to a higher (or equal) current. Prices above every tier fall back to
/// `fallback_amps`. The exact tiers are policy, injected via config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCurrentPolicy")]
pub struct CurrentPolicy {
    tiers: Vec<CurrentTier>,
    fallback_amps: u16,
}

/// Wire form of [`CurrentPolicy`], validated on deserialization.
#[derive(Debug, Deserialize)]
struct RawCurrentPolicy {
    tiers: Vec<CurrentTier>,
    fallback_amps: u16,
}

impl TryFrom<RawCurrentPolicy> for CurrentPolicy {
    type Error = PlanError;

    fn try_from(raw: RawCurrentPolicy) -> Result<Self, Self::Error> {
        Self::new(raw.tiers, raw.fallback_amps)
    }
}

impl CurrentPolicy {
    /// Create a policy, validating tier monotonicity.
    pub fn new(tiers: Vec<CurrentTier>, fallback_amps: u16) -> Result<Self, PlanError> {
        if tiers.is_empty() {
            return Err(PlanError::EmptyPolicy);
        }

        for pair in tiers.windows(2) {
            if pair[1].max_price <= pair[0].max_price {
                return Err(PlanError::NonMonotonicPolicy(format!(
                    "tier bound {} does not increase over {}",
                    pair[1].max_price, pair[0].max_price
                )));
            }
            if pair[1].amps > pair[0].amps {
                return Err(PlanError::NonMonotonicPolicy(format!(
                    "tier at bound {} allows {}A, more than the cheaper tier's {}A",
                    pair[1].max_price, pair[1].amps, pair[0].amps
                )));
            }
        }

        let last = tiers.last().expect("tiers checked non-empty");
        if fallback_amps > last.amps {
            return Err(PlanError::NonMonotonicPolicy(format!(
                "fallback {}A exceeds the most expensive tier's {}A",
                fallback_amps, last.amps
            )));
        }

        Ok(Self {
            tiers,
            fallback_amps,
        })
    }

    /// Select the charging current for a price.
    pub fn amps_for_price(&self, price_per_kwh: f64) -> u16 {
        for tier in &self.tiers {
            if price_per_kwh <= tier.max_price {
                return tier.amps;
            }
        }
        self.fallback_amps
    }
}

impl Default for CurrentPolicy {
    fn default() -> Self {
        Self::new(
            vec![
                CurrentTier {
                    max_price: 0.15,
                    amps: 32,
                },
                CurrentTier {
                    max_price: 0.25,
                    amps: 24,
                },
                CurrentTier {
                    max_price: 0.35,
                    amps: 16,
                },
            ],
            8,
        )
        .expect("built-in tiers are monotonic")
    }
}

/// A schedule entry candidate, ready to submit to the vehicle gateway.
///
/// Time bounds are copied verbatim from the slot (preserving midnight
/// rollover); only the current is derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleCandidate {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub current_amps: u16,
}

/// Translate a slot sequence into schedule candidates, preserving order.
pub fn build_candidates(slots: &[ChargeSlot], policy: &CurrentPolicy) -> Vec<ScheduleCandidate> {
    slots
        .iter()
        .map(|slot| ScheduleCandidate {
            start_time: slot.start_time,
            end_time: slot.end_time,
            current_amps: policy.amps_for_price(slot.price_per_kwh),
        })
        .collect()
}
