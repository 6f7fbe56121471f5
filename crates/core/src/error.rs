//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Unknown IOC type tag.
    #[error("Unknown IOC type: {0}")]
    UnknownIocType(String),

    /// Unknown threat level.
    #[error("Unknown threat level: {0}")]
    UnknownThreatLevel(String),

    /// Unknown IOC status.
    #[error("Unknown IOC status: {0}")]
    UnknownStatus(String),

    /// Unknown trust event reason.
    #[error("Unknown trust event reason: {0}")]
    UnknownReason(String),

    /// IOC value is empty after trimming.
    #[error("IOC value is empty")]
    EmptyValue,

    /// IOC value fails canonicalization for its type.
    #[error("Invalid {ioc_type} value: {reason}")]
    InvalidValue {
        /// The IOC type the value was submitted under.
        ioc_type: crate::types::IocType,
        /// Why the value was rejected.
        reason: String,
    },

    /// Client id is empty.
    #[error("Client id is empty")]
    EmptyClientId,
}

/// Result type alias for CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;
