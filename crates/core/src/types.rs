//! Core types for ThreatNet.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// The kind of observable an IOC describes.
///
/// New kinds are added by extending this tag set; every variant carries its
/// own canonicalization rules (see [`crate::canonical`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IocType {
    /// File content hash (MD5/SHA-1/SHA-256/SHA-512 hex digest).
    FileHash,
    /// IPv4 or IPv6 address.
    IpAddress,
    /// DNS domain name.
    Domain,
    /// Full URL.
    Url,
    /// Email address.
    Email,
    /// Windows registry key path.
    RegistryKey,
    /// Filesystem path.
    FilePath,
    /// Process executable name.
    ProcessName,
}

impl IocType {
    /// Canonical database/wire string representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            IocType::FileHash => "file_hash",
            IocType::IpAddress => "ip_address",
            IocType::Domain => "domain",
            IocType::Url => "url",
            IocType::Email => "email",
            IocType::RegistryKey => "registry_key",
            IocType::FilePath => "file_path",
            IocType::ProcessName => "process_name",
        }
    }
}

impl FromStr for IocType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_hash" => Ok(IocType::FileHash),
            "ip_address" => Ok(IocType::IpAddress),
            "domain" => Ok(IocType::Domain),
            "url" => Ok(IocType::Url),
            "email" => Ok(IocType::Email),
            "registry_key" => Ok(IocType::RegistryKey),
            "file_path" => Ok(IocType::FilePath),
            "process_name" => Ok(IocType::ProcessName),
            _ => Err(CoreError::UnknownIocType(s.to_string())),
        }
    }
}

impl fmt::Display for IocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of the threat an IOC indicates.
///
/// Ordered: `Low < Medium < High < Critical`. The consensus rule relaxes the
/// reporter-count threshold for `Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    /// Low severity.
    Low,
    /// Medium severity.
    Medium,
    /// High severity.
    High,
    /// Critical severity, eligible for the fast verification path.
    Critical,
}

impl ThreatLevel {
    /// Canonical database/wire string representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }
}

impl FromStr for ThreatLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(ThreatLevel::Low),
            "medium" => Ok(ThreatLevel::Medium),
            "high" => Ok(ThreatLevel::High),
            "critical" => Ok(ThreatLevel::Critical),
            _ => Err(CoreError::UnknownThreatLevel(s.to_string())),
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an IOC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IocStatus {
    /// Reported but not yet verified by consensus.
    Pending,
    /// Promoted by the consensus rule; authoritative intel.
    Verified,
    /// Aged out without verification, or explicitly expired.
    Expired,
}

impl IocStatus {
    /// Canonical database/wire string representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            IocStatus::Pending => "pending",
            IocStatus::Verified => "verified",
            IocStatus::Expired => "expired",
        }
    }
}

impl FromStr for IocStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IocStatus::Pending),
            "verified" => Ok(IocStatus::Verified),
            "expired" => Ok(IocStatus::Expired),
            _ => Err(CoreError::UnknownStatus(s.to_string())),
        }
    }
}

impl fmt::Display for IocStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic IOC fingerprint (lowercase hex SHA-256).
///
/// Identical `(type, canonical_value)` pairs always produce the identical id;
/// see [`crate::canonical::fingerprint`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IocId(String);

impl IocId {
    /// Wrap an already-computed fingerprint string.
    pub fn new(hex: String) -> Self {
        IocId(hex)
    }

    /// The hex string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for IocId {
    fn from(s: String) -> Self {
        IocId(s)
    }
}

/// An Indicator of Compromise as stored and broadcast by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ioc {
    /// Deterministic fingerprint of `(ioc_type, value)`.
    pub id: IocId,

    /// The kind of observable.
    pub ioc_type: IocType,

    /// Canonicalized indicator value.
    pub value: String,

    /// Severity.
    pub threat_level: ThreatLevel,

    /// Lifecycle state.
    pub status: IocStatus,

    /// First report time (unix seconds, UTC).
    pub first_seen: i64,

    /// Most recent report time (unix seconds, UTC).
    pub last_seen: i64,

    /// Number of distinct reporting clients.
    pub report_count: u64,

    /// Promotion time, if verified (unix seconds, UTC).
    pub verified_at: Option<i64>,

    /// Reporter-supplied metadata, merged last-writer-wins per key.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A raw IOC submission as received from a client.
///
/// Fields are untyped strings so that malformed payloads surface as
/// `bad_request` at the boundary instead of failing JSON decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IocPayload {
    /// IOC type tag (must parse as [`IocType`]). Accepts `type` on the wire.
    #[serde(alias = "type")]
    pub ioc_type: String,

    /// Raw indicator value (canonicalized on submit).
    pub value: String,

    /// Threat level tag; defaults to `medium` when absent.
    #[serde(default)]
    pub threat_level: Option<String>,

    /// Optional reporter-supplied metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Result of an IOC submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResult {
    /// Fingerprint of the submitted IOC.
    pub ioc_id: IocId,

    /// True if this submission created the IOC row, false if it updated one.
    pub created: bool,

    /// Lifecycle state after this submission was applied.
    pub status: IocStatus,

    /// True iff this submission promoted the IOC to `verified`.
    ///
    /// Fires at most once per verification window.
    pub newly_verified: bool,
}

/// Query filter for IOC listings. All fields are optional and conjunctive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IocFilter {
    /// Match this lifecycle state.
    pub status: Option<IocStatus>,

    /// Match this IOC type.
    pub ioc_type: Option<IocType>,

    /// Match this threat level.
    pub threat_level: Option<ThreatLevel>,

    /// Only IOCs with `last_seen >= since` (unix seconds).
    pub since: Option<i64>,
}

/// Per-client reputation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustScore {
    /// Opaque client identifier (self-asserted on connect).
    pub client_id: String,

    /// Current trust value, always within `[min_trust, max_trust]`.
    pub value: f64,

    /// Total reports submitted.
    pub reports_total: u64,

    /// Reports that contributed to a verified IOC.
    pub reports_accepted: u64,

    /// Reports whose IOC expired unverified.
    pub reports_rejected: u64,

    /// Last heartbeat time (unix seconds), if any.
    pub last_heartbeat_at: Option<i64>,

    /// Last score mutation time; drives decay.
    pub last_updated_at: i64,

    /// Row creation time.
    pub created_at: i64,
}

/// Why a trust score changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustEventReason {
    /// A report was submitted.
    Report,
    /// A report contributed to a verified IOC.
    Accepted,
    /// A report's IOC expired unverified.
    Rejected,
    /// Time-based decay toward the initial trust.
    Decay,
    /// Manual administrative adjustment.
    Manual,
}

impl TrustEventReason {
    /// Canonical database string representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            TrustEventReason::Report => "report",
            TrustEventReason::Accepted => "accepted",
            TrustEventReason::Rejected => "rejected",
            TrustEventReason::Decay => "decay",
            TrustEventReason::Manual => "manual",
        }
    }
}

impl FromStr for TrustEventReason {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "report" => Ok(TrustEventReason::Report),
            "accepted" => Ok(TrustEventReason::Accepted),
            "rejected" => Ok(TrustEventReason::Rejected),
            "decay" => Ok(TrustEventReason::Decay),
            "manual" => Ok(TrustEventReason::Manual),
            _ => Err(CoreError::UnknownReason(s.to_string())),
        }
    }
}

impl fmt::Display for TrustEventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the append-only trust audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustEvent {
    /// The client whose score changed.
    pub client_id: String,

    /// When the change happened (unix seconds).
    pub at: i64,

    /// Signed change applied to the trust value.
    pub delta: f64,

    /// Why the score changed.
    pub reason: TrustEventReason,
}

/// Outcome of a report, as fed back into the Trust Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Report received; no verification verdict yet.
    Submitted,
    /// The reported IOC was verified.
    Accepted,
    /// The reported IOC expired unverified.
    Rejected,
}

/// A connected client's self-description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProfile {
    /// Opaque client identifier.
    pub client_id: String,

    /// Client hostname, as reported.
    #[serde(default)]
    pub hostname: String,

    /// Agent software version, as reported.
    #[serde(default)]
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioc_type_str_conversion() {
        for ty in [
            IocType::FileHash,
            IocType::IpAddress,
            IocType::Domain,
            IocType::Url,
            IocType::Email,
            IocType::RegistryKey,
            IocType::FilePath,
            IocType::ProcessName,
        ] {
            assert_eq!(ty.as_str().parse::<IocType>().unwrap(), ty);
        }
        assert!("floppy_disk".parse::<IocType>().is_err());
    }

    #[test]
    fn test_threat_level_ordering() {
        assert!(ThreatLevel::Low < ThreatLevel::Medium);
        assert!(ThreatLevel::Medium < ThreatLevel::High);
        assert!(ThreatLevel::High < ThreatLevel::Critical);
    }

    #[test]
    fn test_status_str_conversion() {
        assert_eq!("pending".parse::<IocStatus>().unwrap(), IocStatus::Pending);
        assert_eq!(
            "verified".parse::<IocStatus>().unwrap(),
            IocStatus::Verified
        );
        assert_eq!("expired".parse::<IocStatus>().unwrap(), IocStatus::Expired);
        assert!("rejected".parse::<IocStatus>().is_err());
    }

    #[test]
    fn test_serde_snake_case_tags() {
        let json = serde_json::to_string(&IocType::FileHash).unwrap();
        assert_eq!(json, "\"file_hash\"");
        let level: ThreatLevel = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(level, ThreatLevel::Critical);
    }

    #[test]
    fn test_trust_event_reason_roundtrip() {
        for reason in [
            TrustEventReason::Report,
            TrustEventReason::Accepted,
            TrustEventReason::Rejected,
            TrustEventReason::Decay,
            TrustEventReason::Manual,
        ] {
            assert_eq!(reason.as_str().parse::<TrustEventReason>().unwrap(), reason);
        }
    }
}
