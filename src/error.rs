//! Error taxonomy for the EVD core.
//!
//! Errors fall into four categories with distinct propagation rules:
//!
//! * **Programming** — shape violations inside the arithmetic layer
//!   (NTT-state or modulus mismatches, extended-ciphertext mismatches,
//!   invalid ranks). These indicate an implementation bug; the failing
//!   request is aborted and logged, but the owning collection stays
//!   usable.
//! * **Input** — recoverable API-boundary violations, reported back to
//!   the caller with the offending parameter.
//! * **Protocol** — malformed request or response bytes; the transport
//!   must close the session.
//! * **Crypto** — entropy-source failure or a PIR payload decode
//!   anomaly. RNG failure aborts the process-level operation; a decode
//!   anomaly fails only the single retrieve.

use thiserror::Error;

use crate::params::{DEGREE, PIR_PAYLOAD_SIZE, PIR_RANK};

/// Coarse classification used by the service layer to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Implementation bug; unrecoverable for the request.
    Programming,
    /// Caller error; translated into a structured error response.
    Input,
    /// Malformed bytes; the connection must be closed.
    Protocol,
    /// Entropy or integrity failure.
    Crypto,
}

/// All errors surfaced by the EVD core.
#[derive(Debug, Error)]
pub enum EvdError {
    // Programming errors
    #[error("operands disagree on NTT state")]
    InvalidNttState,
    #[error("operands disagree on modulus")]
    ModulusMismatch,
    #[error("ciphertext extended state does not match the operation")]
    InvalidExtendedState,
    #[error("invalid rank {0}")]
    InvalidRank(u64),
    #[error("automorphism exponent {0} must be odd")]
    EvenAutExponent(u64),

    // Input errors
    #[error("dimension {0} must be between 1 and {DEGREE}")]
    InvalidDimension(u64),
    #[error("unknown collection {0:#018x}")]
    UnknownCollection(u64),
    #[error("collection {0:#018x} is empty")]
    EmptyCollection(u64),
    #[error("vector dimension {got} exceeds collection capacity {capacity}")]
    DimensionExceedsRank { got: u64, capacity: u64 },
    #[error("dimension mismatch: collection has dimension {expected}, got {got}")]
    DimensionMismatch { expected: u64, got: u64 },
    #[error("index {index} out of range for database of size {db_size}")]
    IndexOutOfRange { index: u64, db_size: u64 },
    #[error("database size {0} exceeds PIR capacity {cap}", cap = PIR_RANK * PIR_RANK)]
    PirCapacityExceeded(u64),
    #[error("payload of {0} bytes exceeds the {PIR_PAYLOAD_SIZE}-byte limit")]
    PayloadTooLarge(usize),
    #[error("metric {0} has no scale configuration")]
    UnsupportedMetric(String),
    #[error("no secret key available; run setup or configure a key file")]
    SecretKeyUnavailable,
    #[error("database and payload counts differ: {vectors} vectors, {payloads} payloads")]
    PayloadCountMismatch { vectors: usize, payloads: usize },

    // Protocol errors
    #[error("malformed message: {0}")]
    Protocol(&'static str),
    #[error("unexpected setup status {0}")]
    UnexpectedStatus(u8),

    // Crypto errors
    #[error("operating system entropy source unavailable")]
    RngUnavailable,
    #[error("PIR payload decode produced out-of-range value {0}")]
    PayloadDecode(i64),
}

impl EvdError {
    /// Category of this error; drives response mapping and logging.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EvdError::InvalidNttState
            | EvdError::ModulusMismatch
            | EvdError::InvalidExtendedState
            | EvdError::InvalidRank(_)
            | EvdError::EvenAutExponent(_) => ErrorKind::Programming,

            EvdError::InvalidDimension(_)
            | EvdError::UnknownCollection(_)
            | EvdError::EmptyCollection(_)
            | EvdError::DimensionExceedsRank { .. }
            | EvdError::DimensionMismatch { .. }
            | EvdError::IndexOutOfRange { .. }
            | EvdError::PirCapacityExceeded(_)
            | EvdError::PayloadTooLarge(_)
            | EvdError::UnsupportedMetric(_)
            | EvdError::SecretKeyUnavailable
            | EvdError::PayloadCountMismatch { .. } => ErrorKind::Input,

            EvdError::Protocol(_) | EvdError::UnexpectedStatus(_) => ErrorKind::Protocol,

            EvdError::RngUnavailable | EvdError::PayloadDecode(_) => ErrorKind::Crypto,
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, EvdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_partition_the_taxonomy() {
        assert_eq!(EvdError::InvalidNttState.kind(), ErrorKind::Programming);
        assert_eq!(EvdError::InvalidDimension(0).kind(), ErrorKind::Input);
        assert_eq!(EvdError::Protocol("short read").kind(), ErrorKind::Protocol);
        assert_eq!(EvdError::RngUnavailable.kind(), ErrorKind::Crypto);
        assert_eq!(EvdError::PayloadDecode(7).kind(), ErrorKind::Crypto);
    }

    #[test]
    fn messages_name_the_failing_parameter() {
        let msg = EvdError::IndexOutOfRange {
            index: 12,
            db_size: 10,
        }
        .to_string();
        assert!(msg.contains("12"));
        assert!(msg.contains("10"));
    }
}
