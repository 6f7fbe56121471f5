//! ThreatNet consensus engine.
//!
//! This crate implements the deterministic promotion rule that turns pending
//! IOCs into verified intelligence:
//! - Base path: enough distinct reporters AND a high enough mean trust
//! - Critical fast path: the count threshold is relaxed by one (floor 1) but
//!   the mean-trust bar rises to the critical bypass level
//!
//! The predicate is a pure function over `(report_count, mean_trust,
//! threat_level, policy)` so it can be unit-tested without any store.

use threatnet_core::ThreatLevel;

/// Consensus promotion policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsensusPolicy {
    /// Minimum number of distinct reporters for the base path.
    pub threshold: u64,
    /// Minimum mean reporter trust for the base path.
    pub trust_avg: f64,
    /// Minimum mean reporter trust for the relaxed critical path.
    pub critical_trust_bypass: f64,
}

/// Policy validation errors.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PolicyError {
    /// The base threshold must require at least one reporter.
    #[error("invalid consensus policy: threshold must be >= 1 (got {0})")]
    ZeroThreshold(u64),

    /// Trust bars must be probabilities.
    #[error("invalid consensus policy: {name} must be within [0, 1] (got {value})")]
    TrustOutOfRange {
        /// Which field was out of range.
        name: &'static str,
        /// The offending value.
        value: f64,
    },

    /// The critical bar must not be easier than the base bar.
    #[error(
        "invalid consensus policy: critical_trust_bypass ({bypass}) must be >= trust_avg ({avg})"
    )]
    BypassBelowAverage {
        /// Configured critical bar.
        bypass: f64,
        /// Configured base bar.
        avg: f64,
    },
}

impl ConsensusPolicy {
    /// Create a policy with basic validation.
    pub fn new(threshold: u64, trust_avg: f64, critical_trust_bypass: f64) -> Result<Self, PolicyError> {
        if threshold == 0 {
            return Err(PolicyError::ZeroThreshold(threshold));
        }
        if !(0.0..=1.0).contains(&trust_avg) {
            return Err(PolicyError::TrustOutOfRange {
                name: "trust_avg",
                value: trust_avg,
            });
        }
        if !(0.0..=1.0).contains(&critical_trust_bypass) {
            return Err(PolicyError::TrustOutOfRange {
                name: "critical_trust_bypass",
                value: critical_trust_bypass,
            });
        }
        if critical_trust_bypass < trust_avg {
            return Err(PolicyError::BypassBelowAverage {
                bypass: critical_trust_bypass,
                avg: trust_avg,
            });
        }
        Ok(Self {
            threshold,
            trust_avg,
            critical_trust_bypass,
        })
    }

    /// The reporter-count threshold for a given threat level.
    ///
    /// Critical IOCs get the threshold relaxed by one, never below 1.
    pub fn threshold_for(&self, threat_level: ThreatLevel) -> u64 {
        if threat_level == ThreatLevel::Critical {
            self.threshold.saturating_sub(1).max(1)
        } else {
            self.threshold
        }
    }
}

/// Evaluate the consensus predicate.
///
/// Returns true iff the IOC should be promoted to `verified` given the
/// current distinct-reporter count and the mean of their trust scores.
pub fn evaluate(
    report_count: u64,
    mean_trust: f64,
    threat_level: ThreatLevel,
    policy: &ConsensusPolicy,
) -> bool {
    if report_count >= policy.threshold && mean_trust >= policy.trust_avg {
        return true;
    }

    // Critical fast path: one fewer reporter, higher trust bar.
    threat_level == ThreatLevel::Critical
        && report_count >= policy.threshold_for(threat_level)
        && mean_trust >= policy.critical_trust_bypass
}
