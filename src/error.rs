//! Matchable error kinds for volume operations.
//!
//! Fallible paths return `eyre::Result`; the kinds a caller needs to react
//! to programmatically (duplicate insert, missing key, corrupt node file)
//! are raised as [`StoreError`] values inside the report and recovered with
//! [`store_error`]. Everything else (plain filesystem failures, wrapped
//! context) stays a free-form report, the way the storage layer's other
//! modules already produce them.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key {0} already present")]
    DuplicateKey(u64),

    #[error("key {0} not found")]
    KeyNotFound(u64),

    #[error("node file for slot {slot} is unreadable: {reason}")]
    Corruption { slot: u64, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("tree invariant violated: {0}")]
    InvariantViolation(String),

    #[error("expiry worker already started")]
    AlreadyStarted,
}

impl StoreError {
    pub fn corruption(slot: u64, reason: impl Into<String>) -> Self {
        Self::Corruption {
            slot,
            reason: reason.into(),
        }
    }
}

/// Extracts the [`StoreError`] kind from a report, if one is attached.
pub fn store_error(report: &eyre::Report) -> Option<&StoreError> {
    report.downcast_ref::<StoreError>()
}

/// Whether `report` carries [`StoreError::KeyNotFound`].
///
/// The expiry worker and idempotent-delete callers branch on this.
pub fn is_key_not_found(report: &eyre::Report) -> bool {
    matches!(store_error(report), Some(StoreError::KeyNotFound(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_survive_the_eyre_boundary() {
        let report = eyre::Report::new(StoreError::DuplicateKey(7));
        assert!(matches!(
            store_error(&report),
            Some(StoreError::DuplicateKey(7))
        ));
        assert!(!is_key_not_found(&report));
    }

    #[test]
    fn key_not_found_is_detected_through_context() {
        let report = eyre::Report::new(StoreError::KeyNotFound(3));
        assert!(is_key_not_found(&report));
    }

    #[test]
    fn corruption_carries_slot_and_reason() {
        let err = StoreError::corruption(12, "short read");
        assert_eq!(
            err.to_string(),
            "node file for slot 12 is unreadable: short read"
        );
    }
}
