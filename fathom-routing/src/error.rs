//! Routing error types.

use thiserror::Error;

/// Result type for routing operations.
pub type RoutingResult<T> = Result<T, RoutingError>;

/// Errors raised by topology validation and sharding expressions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// Cluster configuration is invalid.
    #[error("invalid cluster '{cluster}': {reason}")]
    InvalidCluster {
        /// Cluster name.
        cluster: String,
        /// Why it is invalid.
        reason: String,
    },

    /// No cluster with this name is configured.
    #[error("cluster '{name}' not found")]
    ClusterNotFound {
        /// Requested name.
        name: String,
    },

    /// The sharding expression could not be parsed.
    #[error("cannot parse sharding expression '{expr}' at {position}: {reason}")]
    Parse {
        /// Expression text.
        expr: String,
        /// Byte offset of the problem.
        position: usize,
        /// What went wrong.
        reason: &'static str,
    },

    /// The expression calls an unknown function or with the wrong arity.
    #[error("unknown function '{name}' with {arity} argument(s)")]
    UnknownFunction {
        /// Function name.
        name: String,
        /// Number of arguments given.
        arity: usize,
    },

    /// The expression references a column missing from the block.
    #[error("sharding expression references missing column '{name}'")]
    MissingColumn {
        /// Column name.
        name: String,
    },

    /// Evaluating the expression failed for a row.
    #[error("cannot evaluate sharding expression '{expr}': {reason}")]
    Evaluation {
        /// Expression text.
        expr: String,
        /// What went wrong.
        reason: String,
    },
}
