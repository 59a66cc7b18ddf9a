//! Spool error types.
//!
//! All errors are explicit and typed. No string errors.

use thiserror::Error;

/// Result type for spool operations.
pub type SpoolResult<T> = Result<T, SpoolError>;

/// Errors that can occur during spool operations.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// Entry payload exceeds maximum size.
    #[error("entry too large: {size} bytes exceeds max {max} bytes")]
    EntryTooLarge {
        /// Actual size in bytes.
        size: u64,
        /// Maximum allowed size.
        max: u32,
    },

    /// CRC checksum mismatch indicates corruption.
    #[error("checksum mismatch in {file}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// File holding the entry.
        file: String,
        /// Expected CRC32 value.
        expected: u32,
        /// Actual CRC32 value stored in the entry.
        actual: u32,
    },

    /// Entry header is invalid or the file is truncated.
    #[error("invalid entry in {file}: {reason}")]
    InvalidEntry {
        /// File holding the entry.
        file: String,
        /// Why the entry is invalid.
        reason: &'static str,
    },

    /// A mutation was attempted on a spool opened for inspection.
    #[error("spool {dir} is opened read-only")]
    ReadOnly {
        /// Spool directory.
        dir: String,
    },

    /// I/O error from underlying storage.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}

impl SpoolError {
    /// Creates an I/O error.
    pub fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true if this error indicates a corrupt entry.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::InvalidEntry { .. }
        )
    }
}
