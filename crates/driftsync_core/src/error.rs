//! Error types for the core crate.

use crate::checksum::Checksum;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the delta engine.
///
/// Both checksum variants are validation failures: the patch cannot be
/// applied to the given base and retrying will not change that.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The base payload is not the one the patch was computed from.
    #[error("stale base: expected source checksum {expected}, found {actual}")]
    SourceChecksumMismatch {
        /// Checksum recorded in the patch.
        expected: Checksum,
        /// Checksum of the supplied base.
        actual: Checksum,
    },

    /// Applying the patch did not produce the recorded target.
    #[error("corrupted patch: expected target checksum {expected}, found {actual}")]
    TargetChecksumMismatch {
        /// Checksum recorded in the patch.
        expected: Checksum,
        /// Checksum of the produced payload.
        actual: Checksum,
    },

    /// The payload is structurally invalid.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl CoreError {
    /// Returns true if this error indicates a checksum mismatch.
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(
            self,
            CoreError::SourceChecksumMismatch { .. } | CoreError::TargetChecksumMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_errors_are_flagged() {
        let a = Checksum::from_bytes([1u8; 32]);
        let b = Checksum::from_bytes([2u8; 32]);
        assert!(CoreError::SourceChecksumMismatch {
            expected: a,
            actual: b
        }
        .is_checksum_mismatch());
        assert!(!CoreError::MalformedPayload("x".into()).is_checksum_mismatch());
    }

    #[test]
    fn error_display_includes_hex() {
        let err = CoreError::TargetChecksumMismatch {
            expected: Checksum::from_bytes([0xab; 32]),
            actual: Checksum::from_bytes([0u8; 32]),
        };
        assert!(err.to_string().contains("abab"));
    }
}
