//! # ThreatNet Coordinator
//!
//! Central coordinator of the ThreatNet federated threat-intelligence
//! exchange:
//! - **Trust Manager**: per-client reputation with multi-factor scoring and
//!   time decay
//! - **Intelligence Aggregator**: IOC deduplication and trust-weighted
//!   consensus promotion
//! - **Distribution fabric**: live client sessions with bounded fan-out of
//!   verification events
//! - **HTTP API + WebSocket channel**: the outward-facing facade

#![warn(missing_docs)]

pub mod aggregator;
pub mod config;
pub mod fabric;
pub mod locks;
pub mod outcome;
pub mod server;
pub mod storage;
pub mod tasks;
pub mod trust;

/// Current UTC time as unix seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
