//! Helmsman Trading Control Plane
//!
//! This library provides the core components of the Helmsman autonomous
//! perpetual-futures trading agent: the decision loop scheduler, the
//! exchange-facing request coordinator, the risk and stop engine, and the
//! reconciliation service that keeps local state consistent with the venue.

pub mod api;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
