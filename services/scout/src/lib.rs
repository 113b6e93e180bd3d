//! The scout: a lightweight vehicle poller.
//!
//! Every cycle the scout fetches exactly one vehicle snapshot and, when
//! the vehicle is online, charge-ready, and at home, fires one trigger
//! at the worker. It never mutates schedules and holds no durable state
//! of its own; credentials come from a read-only view of the worker's
//! state store and are discarded after each poll.

pub mod api;
pub mod config;
pub mod poller;
pub mod worker_client;
