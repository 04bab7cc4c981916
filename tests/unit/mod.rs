// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for the PostgreSQL HA operator
//!
//! This module contains unit tests for:
//! - Instance, service, config and backup generators
//! - Spec enforcers and the enforcement runner
//! - Topology planning and failover
//! - Validation and status
//! - Full reconcile passes against an in-memory store

#[path = "../common/mod.rs"]
mod common;

mod context;
mod status;
