//! Canonicalization and fingerprinting of IOC values.
//!
//! Every IOC type has a canonical textual form; the deterministic IOC id is a
//! domain-separated SHA-256 over the type tag and the canonical value, so the
//! same observable reported by different clients always maps to the same row.

use sha2::{Digest, Sha256};
use std::net::IpAddr;

use crate::error::CoreError;
use crate::types::{IocId, IocType};

/// Domain separator for IOC fingerprints.
const FINGERPRINT_DOMAIN: &str = "threatnet:ioc:v1";

/// Hex digest lengths accepted for `file_hash` values (MD5, SHA-1, SHA-256, SHA-512).
const HASH_DIGEST_LENGTHS: [usize; 4] = [32, 40, 64, 128];

/// Canonicalize a raw IOC value for its type.
///
/// Rules per type:
/// - `file_hash`: lowercase hex; length must match a known digest size
/// - `ip_address`: parsed and re-rendered via [`std::net::IpAddr`]
/// - `domain`, `email`: lowercased (trailing dot stripped for domains)
/// - `url`: trimmed; must carry a scheme
/// - `registry_key`, `file_path`, `process_name`: trimmed as-is
pub fn canonicalize(ioc_type: IocType, value: &str) -> Result<String, CoreError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CoreError::EmptyValue);
    }

    match ioc_type {
        IocType::FileHash => {
            let lower = trimmed.to_ascii_lowercase();
            if !lower.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(CoreError::InvalidValue {
                    ioc_type,
                    reason: "expected a hex digest".to_string(),
                });
            }
            if !HASH_DIGEST_LENGTHS.contains(&lower.len()) {
                return Err(CoreError::InvalidValue {
                    ioc_type,
                    reason: format!("unexpected digest length {}", lower.len()),
                });
            }
            Ok(lower)
        }
        IocType::IpAddress => {
            let addr: IpAddr = trimmed.parse().map_err(|_| CoreError::InvalidValue {
                ioc_type,
                reason: "not a valid IP address".to_string(),
            })?;
            Ok(addr.to_string())
        }
        IocType::Domain => {
            let lower = trimmed.trim_end_matches('.').to_ascii_lowercase();
            if lower.is_empty()
                || !lower
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
            {
                return Err(CoreError::InvalidValue {
                    ioc_type,
                    reason: "not a valid domain name".to_string(),
                });
            }
            Ok(lower)
        }
        IocType::Email => {
            let lower = trimmed.to_ascii_lowercase();
            if !lower.contains('@') {
                return Err(CoreError::InvalidValue {
                    ioc_type,
                    reason: "missing '@'".to_string(),
                });
            }
            Ok(lower)
        }
        IocType::Url => {
            if !trimmed.contains("://") {
                return Err(CoreError::InvalidValue {
                    ioc_type,
                    reason: "missing URL scheme".to_string(),
                });
            }
            Ok(trimmed.to_string())
        }
        IocType::RegistryKey | IocType::FilePath | IocType::ProcessName => {
            Ok(trimmed.to_string())
        }
    }
}

/// Compute the deterministic fingerprint of a canonicalized IOC.
///
/// The digest is domain-separated and covers both the type tag and the value,
/// so `("domain", "1.2.3.4")` and `("ip_address", "1.2.3.4")` get distinct ids.
pub fn fingerprint(ioc_type: IocType, canonical_value: &str) -> IocId {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_DOMAIN.as_bytes());
    hasher.update([0u8]);
    hasher.update(ioc_type.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_value.as_bytes());
    IocId::new(hex::encode(hasher.finalize()))
}
