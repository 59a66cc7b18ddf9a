//! Distributed table error types.
//!
//! Errors that reach a caller carry a descriptive message. Background
//! delivery failures never reach a caller; they are logged and counted by
//! the replication queue.

use fathom_core::{CoreError, ShardNum};
use fathom_routing::RoutingError;
use fathom_spool::SpoolError;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type for distributed table operations.
pub type DistResult<T> = Result<T, DistError>;

/// Errors that can occur in distributed table operations.
#[derive(Debug, Error)]
pub enum DistError {
    /// The table is configured in a way that does not allow the operation.
    #[error("configuration error: {message}")]
    Configuration {
        /// What is wrong.
        message: String,
    },

    /// The operation is not supported by this table type.
    #[error("unsupported operation: {message}")]
    UnsupportedOperation {
        /// What is unsupported.
        message: String,
    },

    /// A required background service is not running.
    #[error("service unavailable: {service}")]
    ServiceUnavailable {
        /// Missing service.
        service: &'static str,
    },

    /// An argument was invalid.
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument {
        /// Argument name.
        name: &'static str,
        /// Why it was invalid.
        reason: String,
    },

    /// A batch could not be delivered to a remote shard.
    #[error("delivery to {endpoint} failed: {message}")]
    DeliveryFailure {
        /// Replica address.
        endpoint: String,
        /// Transport error.
        message: String,
    },

    /// A replica could not be reached.
    #[error("cannot connect to {endpoint}: {message}")]
    Connection {
        /// Replica address.
        endpoint: String,
        /// Transport error.
        message: String,
    },

    /// A shard failed while serving a fanned-out query.
    #[error("{shard} failed: {message}")]
    ShardFailure {
        /// Failing shard.
        shard: ShardNum,
        /// What went wrong.
        message: String,
    },

    /// The operation was cancelled because a sibling failed.
    #[error("cancelled")]
    Cancelled,

    /// A task panicked. The panic payload is not carried.
    #[error("unknown fault during {operation}")]
    Panicked {
        /// What was running.
        operation: &'static str,
    },

    /// The coordinator registry rejected a call.
    #[error("coordinator registry error: {operation}: {message}")]
    Registry {
        /// Registry operation.
        operation: &'static str,
        /// Error message.
        message: String,
    },

    /// The catalog rejected a schema change.
    #[error("catalog error: {message}")]
    Catalog {
        /// Error message.
        message: String,
    },

    /// Local storage failed.
    #[error("storage error: {operation}: {message}")]
    Storage {
        /// Storage operation.
        operation: &'static str,
        /// Error message.
        message: String,
    },

    /// Invalid static configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Value, block or schema error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Topology or sharding expression error.
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Spool error.
    #[error(transparent)]
    Spool(#[from] SpoolError),
}

impl DistError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    pub fn connection(endpoint: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        Self::Connection {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        }
    }

    /// Creates a registry error.
    pub fn registry(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Registry {
            operation,
            message: err.to_string(),
        }
    }

    /// Creates a storage error.
    pub fn storage(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Storage {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true if a remote replica could not be reached at all, so
    /// the next replica of the same shard may be tried.
    #[must_use]
    pub const fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}
