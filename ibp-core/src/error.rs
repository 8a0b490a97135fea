//! Error types for the IBP depot engine
//!
//! Provides a unified error type for all resource and allocation operations.

use crate::allocation::AllocationId;
use thiserror::Error;

/// Result type alias for depot operations
pub type Result<T> = std::result::Result<T, IbpError>;

/// Unified error type for the depot engine
#[derive(Error, Debug)]
pub enum IbpError {
    // ===== Lookup Errors =====
    #[error("Allocation not found: {0}")]
    NotFound(String),

    // ===== Quota Errors =====
    #[error("Out of space: {needed} bytes could not be reclaimed")]
    OutOfSpace { needed: u64 },

    #[error("Insufficient master space: requested {requested}, master holds {available}")]
    InsufficientMasterSpace { requested: u64, available: u64 },

    #[error("Duration too long: {requested}s exceeds maximum of {max}s")]
    DurationTooLong { requested: u64, max: u64 },

    // ===== Device Errors =====
    #[error("Device error: {0}")]
    Device(String),

    // ===== Index Errors =====
    #[error("Index error: {0}")]
    Index(String),

    #[error("Corrupt record for id {id}: {reason}")]
    CorruptRecord { id: AllocationId, reason: String },

    // ===== Resource Errors =====
    #[error("Resource already pending: {0}")]
    AlreadyPending(String),

    #[error("Operation not permitted by resource mode: {0}")]
    ModeDisabled(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid reference count operation on {id}: {reason}")]
    InvalidRefcount { id: AllocationId, reason: String },

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl IbpError {
    /// Shorthand for a missing allocation id
    pub fn missing_id(id: AllocationId) -> Self {
        IbpError::NotFound(format!("id {}", id))
    }

    /// Quota rejection for a size that does not fit in 64 bits
    pub fn size_overflow() -> Self {
        IbpError::OutOfSpace { needed: u64::MAX }
    }

    /// True when the error is a quota rejection
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, IbpError::OutOfSpace { .. })
    }
}

impl From<bincode::Error> for IbpError {
    fn from(err: bincode::Error) -> Self {
        IbpError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IbpError::InsufficientMasterSpace {
            requested: 500,
            available: 100,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient master space: requested 500, master holds 100"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: IbpError = io_err.into();
        assert!(matches!(err, IbpError::Io(_)));
    }

    #[test]
    fn test_out_of_space_predicate() {
        assert!(IbpError::OutOfSpace { needed: 1 }.is_out_of_space());
        assert!(!IbpError::missing_id(AllocationId::new(7)).is_out_of_space());
        assert!(IbpError::size_overflow().is_out_of_space());
    }
}
