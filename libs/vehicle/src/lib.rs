//! Vehicle gateway and price feed interfaces.
//!
//! The vehicle gateway and the price feed are external collaborators,
//! reached over HTTP and treated as opaque request/response interfaces.
//! This library provides:
//!
//! - The data model both services share (snapshots, schedule entries,
//!   special sessions, credentials).
//! - The [`GatewayError`] taxonomy every client call reduces to.
//! - Async traits for both collaborators, so the reconciler can be
//!   driven by in-memory fakes in tests.
//! - `reqwest`-based implementations with explicit per-call timeouts.

mod error;
mod gateway;
mod pricing;
mod types;

pub use error::GatewayError;
pub use gateway::{HttpVehicleGateway, VehicleGateway};
pub use pricing::{HttpPriceFeed, PlanRequest, PriceFeed};
pub use types::{
    CredentialSet, EntryTag, LocationTag, ScheduleEntry, SessionStatus, SpecialSession,
    VehicleSnapshot,
};
