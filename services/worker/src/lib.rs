//! Reconciliation worker library.
//!
//! The worker owns the full reconciliation cycle: wake-if-needed, plan
//! fetch, fingerprint comparison, add-before-remove schedule rewrite,
//! and the token refresh lifecycle on behalf of the scout.

pub mod api;
pub mod config;
pub mod custodian;
pub mod reconciler;
pub mod state;
pub mod triggers;
