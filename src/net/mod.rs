//! Networked collaborators for the `cohortd` daemon.
//!
//! These modules are gated behind the `net` Cargo feature: a reqwest-backed
//! implementation of [`Network`](crate::Network) that talks to the survey
//! coordinator, and the read-only local status service.

#![cfg(feature = "net")]

/// Coordinator HTTP client.
pub mod http;
/// Local read-only status service.
pub mod status;

pub use http::HttpNetwork;
pub use status::{run_status_server, StatusConfig};
