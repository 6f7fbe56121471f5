//! # ThreatNet Core
//!
//! Core types for the ThreatNet federated threat-intelligence exchange.
//!
//! This crate provides the shared vocabulary used across all ThreatNet
//! components: IOC types and their canonical forms, the deterministic IOC
//! fingerprint, trust records, and the core error type. It is kept
//! dependency-light so both the consensus engine and the coordinator service
//! can build on it.

#![warn(missing_docs)]

pub mod canonical;
pub mod error;
pub mod types;

// Re-export commonly used items
pub use canonical::{canonicalize, fingerprint};
pub use error::{CoreError, Result};
pub use types::*;
