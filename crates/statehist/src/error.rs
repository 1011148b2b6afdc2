//! Error and Result types for state history operations.

use crate::interval::{Quark, Timestamp};
use crate::value::ValueType;
use std::io;
use thiserror::Error;

/// A convenience `Result` type for state history operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// The error type for state history operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// The requested attribute path or quark does not exist.
    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    /// An attribute pattern could not be interpreted.
    #[error("Invalid attribute pattern: {0}")]
    InvalidPattern(String),

    /// The requested time lies outside the bounds of the store.
    #[error("Time {time} outside of range [{start}, {end}]")]
    TimeRangeInvalid {
        /// Requested timestamp.
        time: Timestamp,
        /// Start of the valid range (inclusive).
        start: Timestamp,
        /// End of the valid range (inclusive).
        end: Timestamp,
    },

    /// A state value was read as a type it does not hold.
    #[error("State value type mismatch: expected {expected}, got {actual}")]
    StateValueTypeMismatch {
        /// The type the caller asked for.
        expected: ValueType,
        /// The type actually stored.
        actual: ValueType,
    },

    /// The state system was disposed and can no longer be queried.
    #[error("State system has been disposed")]
    StoreDisposed,

    /// The writer produced an interval that does not follow the previous one.
    #[error("Contiguity violation on quark {quark}: expected start {expected}, got {actual}")]
    ContiguityViolation {
        /// Attribute the interval belongs to.
        quark: Quark,
        /// Start time the next interval had to have.
        expected: Timestamp,
        /// Start time it actually had.
        actual: Timestamp,
    },

    /// The store detected an internal inconsistency and rejects all queries.
    #[error("State history is corrupted")]
    StoreCorrupted,

    /// A long-running operation observed its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid magic bytes in a history file header.
    #[error("Invalid magic bytes: expected SHTF, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported history file format or provider version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),

    /// Stored checksum does not match the data read back.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// Persisted bytes or an input event could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A single interval does not fit in an empty history tree node.
    #[error("Interval of {size} bytes exceeds node capacity of {capacity} bytes")]
    IntervalTooLarge {
        /// Encoded size of the interval.
        size: usize,
        /// Usable bytes in a node.
        capacity: usize,
    },

    /// A configuration value or call argument was rejected.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl StateError {
    /// Returns true for errors after which the builder must stop writing.
    ///
    /// Per-event problems are recoverable: bad payloads, out-of-order
    /// timestamps, wrong value types and values too large to store, which are
    /// rejected before anything is written. Anything touching the integrity
    /// of the store is not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ContiguityViolation { .. }
                | Self::StoreCorrupted
                | Self::StoreDisposed
                | Self::IoError(_)
                | Self::ChecksumMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(StateError::StoreCorrupted.is_fatal());
        assert!(StateError::ContiguityViolation {
            quark: 1,
            expected: 10,
            actual: 12
        }
        .is_fatal());
        assert!(!StateError::Decode("bad".to_string()).is_fatal());
        assert!(!StateError::IntervalTooLarge {
            size: 5025,
            capacity: 4012
        }
        .is_fatal());
        assert!(!StateError::TimeRangeInvalid {
            time: 0,
            start: 1,
            end: 2
        }
        .is_fatal());
    }

    #[test]
    fn test_display_mentions_bounds() {
        let err = StateError::TimeRangeInvalid {
            time: 50,
            start: 0,
            end: 29,
        };
        assert_eq!(err.to_string(), "Time 50 outside of range [0, 29]");
    }
}
