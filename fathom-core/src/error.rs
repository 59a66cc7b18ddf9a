//! Core error types.
//!
//! All errors are explicit and typed. No string errors.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while encoding blocks, applying schema changes or
/// evaluating aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Binary data could not be decoded.
    #[error("decode error: {reason}")]
    Decode {
        /// Why decoding failed.
        reason: &'static str,
    },

    /// A referenced column does not exist.
    #[error("column '{name}' not found")]
    ColumnNotFound {
        /// Column name.
        name: String,
    },

    /// A column with this name already exists.
    #[error("column '{name}' already exists")]
    ColumnExists {
        /// Column name.
        name: String,
    },

    /// A value had an unexpected type.
    #[error("type mismatch in '{column}': expected {expected}, got {actual}")]
    TypeMismatch {
        /// Column (or expression) name.
        column: String,
        /// Expected type.
        expected: &'static str,
        /// Actual type.
        actual: &'static str,
    },

    /// An argument was invalid.
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument {
        /// Argument name.
        name: &'static str,
        /// Why it was invalid.
        reason: String,
    },

    /// A resource limit was exceeded.
    #[error("limit exceeded: {limit} (max={max}, actual={actual})")]
    LimitExceeded {
        /// Which limit was exceeded.
        limit: &'static str,
        /// The maximum allowed value.
        max: u64,
        /// The actual value.
        actual: u64,
    },
}

impl CoreError {
    /// Creates a column-not-found error.
    pub fn column_not_found(name: impl Into<String>) -> Self {
        Self::ColumnNotFound { name: name.into() }
    }
}
