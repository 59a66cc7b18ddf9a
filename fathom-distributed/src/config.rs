//! Configuration for distributed tables.
//!
//! - [`TableConfig`]: static table definition (names, sharding key, spool path)
//! - [`QueueConfig`]: replication queue retry timing
//! - [`Settings`]: per-query settings

use std::path::PathBuf;
use std::time::Duration;

use fathom_core::limits::IDENTIFIER_LENGTH_MAX;
use fathom_core::TableRef;

/// Default initial backoff after a failed delivery.
pub const QUEUE_INITIAL_BACKOFF_MS: u64 = 100;

/// Default maximum backoff between delivery attempts.
pub const QUEUE_MAX_BACKOFF_MS: u64 = 30_000;

/// Default maximum number of concurrently open shard streams.
pub const MAX_DISTRIBUTED_CONNECTIONS_DEFAULT: u32 = 1024;

// -----------------------------------------------------------------------------
// Settings
// -----------------------------------------------------------------------------

/// How subqueries marked `GLOBAL` are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GlobalSubqueriesMethod {
    /// Evaluate once on the initiator and push the result to every shard
    /// as an external table.
    Push,
    /// Let every shard evaluate the subquery itself. External tables are
    /// not sent.
    #[default]
    Pull,
}

/// Per-query settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Replicas of one remote shard that may serve a query in parallel.
    /// Only affects the processing stage; dispatch uses one replica.
    pub max_parallel_replicas: u32,
    /// Ask shards for complete results and skip the final merge.
    pub distributed_group_by_no_merge: bool,
    /// External table policy.
    pub global_subqueries_method: GlobalSubqueriesMethod,
    /// Maximum number of shard streams open at once.
    pub max_distributed_connections: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_parallel_replicas: 1,
            distributed_group_by_no_merge: false,
            global_subqueries_method: GlobalSubqueriesMethod::Pull,
            max_distributed_connections: MAX_DISTRIBUTED_CONNECTIONS_DEFAULT,
        }
    }
}

impl Settings {
    /// Creates default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `max_parallel_replicas`.
    #[must_use]
    pub const fn with_max_parallel_replicas(mut self, replicas: u32) -> Self {
        self.max_parallel_replicas = replicas;
        self
    }

    /// Sets `distributed_group_by_no_merge`.
    #[must_use]
    pub const fn with_group_by_no_merge(mut self, no_merge: bool) -> Self {
        self.distributed_group_by_no_merge = no_merge;
        self
    }

    /// Sets the external table policy.
    #[must_use]
    pub const fn with_global_subqueries_method(mut self, method: GlobalSubqueriesMethod) -> Self {
        self.global_subqueries_method = method;
        self
    }

    /// Sets `max_distributed_connections`.
    #[must_use]
    pub const fn with_max_distributed_connections(mut self, connections: u32) -> Self {
        self.max_distributed_connections = connections;
        self
    }

    /// Validates the settings.
    ///
    /// # Errors
    /// Returns an error if a count is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_replicas == 0 {
            return Err(ConfigError::InvalidSettings {
                message: "max_parallel_replicas must be >= 1".to_string(),
            });
        }
        if self.max_distributed_connections == 0 {
            return Err(ConfigError::InvalidSettings {
                message: "max_distributed_connections must be >= 1".to_string(),
            });
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// QueueConfig
// -----------------------------------------------------------------------------

/// Retry timing of replication queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Backoff after the first failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound of the doubling backoff.
    pub max_backoff: Duration,
    /// Add up to 10% random jitter to each backoff.
    pub jitter: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(QUEUE_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(QUEUE_MAX_BACKOFF_MS),
            jitter: true,
        }
    }
}

impl QueueConfig {
    /// Short, deterministic backoff for tests.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(40),
            jitter: false,
        }
    }

    /// Sets the initial backoff.
    #[must_use]
    pub const fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Sets the maximum backoff.
    #[must_use]
    pub const fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if the initial backoff is zero or above the maximum.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff.is_zero() {
            return Err(ConfigError::InvalidQueue {
                message: "initial_backoff must be > 0".to_string(),
            });
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::InvalidQueue {
                message: "max_backoff must be >= initial_backoff".to_string(),
            });
        }
        Ok(())
    }

    /// Returns the backoff that follows `current`.
    #[must_use]
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff)
    }

    /// Applies jitter to a backoff.
    #[must_use]
    pub fn jittered(&self, backoff: Duration) -> Duration {
        use rand::Rng;

        if !self.jitter {
            return backoff;
        }
        #[allow(clippy::cast_possible_truncation)] // Bounded by max_backoff.
        let max_extra_ms = (backoff.as_millis() / 10) as u64;
        backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=max_extra_ms))
    }
}

// -----------------------------------------------------------------------------
// TableConfig
// -----------------------------------------------------------------------------

/// Static definition of a distributed table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    /// Database of the distributed table.
    pub database: String,
    /// Name of the distributed table.
    pub name: String,
    /// Database of the backing table on every shard.
    pub remote_database: String,
    /// Name of the backing table on every shard.
    pub remote_table: String,
    /// Sharding expression text.
    pub sharding_key: Option<String>,
    /// Root of spool directories; `None` makes the table read-only.
    pub data_path: Option<PathBuf>,
    /// Replication queue timing.
    pub queue: QueueConfig,
}

impl TableConfig {
    /// Creates a configuration without sharding key or data path.
    #[must_use]
    pub fn new(
        database: impl Into<String>,
        name: impl Into<String>,
        remote_database: impl Into<String>,
        remote_table: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            name: name.into(),
            remote_database: remote_database.into(),
            remote_table: remote_table.into(),
            sharding_key: None,
            data_path: None,
            queue: QueueConfig::default(),
        }
    }

    /// Sets the sharding expression.
    #[must_use]
    pub fn with_sharding_key(mut self, expr: impl Into<String>) -> Self {
        self.sharding_key = Some(expr.into());
        self
    }

    /// Sets the spool root.
    #[must_use]
    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    /// Sets the queue configuration.
    #[must_use]
    pub fn with_queue_config(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// The distributed table itself.
    #[must_use]
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.database, &self.name)
    }

    /// The backing table every shard reads and writes.
    #[must_use]
    pub fn remote_ref(&self) -> TableRef {
        TableRef::new(&self.remote_database, &self.remote_table)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error for empty or oversized identifiers and invalid queue
    /// timing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("database", &self.database),
            ("name", &self.name),
            ("remote_database", &self.remote_database),
            ("remote_table", &self.remote_table),
        ] {
            if value.is_empty() {
                return Err(ConfigError::InvalidTable {
                    message: format!("{field} must not be empty"),
                });
            }
            if value.len() > IDENTIFIER_LENGTH_MAX {
                return Err(ConfigError::InvalidTable {
                    message: format!("{field} exceeds {IDENTIFIER_LENGTH_MAX} bytes"),
                });
            }
        }
        if self.sharding_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            return Err(ConfigError::InvalidTable {
                message: "sharding_key must not be blank".to_string(),
            });
        }
        self.queue.validate()
    }
}

// -----------------------------------------------------------------------------
// ConfigError
// -----------------------------------------------------------------------------

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid table definition.
    InvalidTable {
        /// Error description.
        message: String,
    },
    /// Invalid query settings.
    InvalidSettings {
        /// Error description.
        message: String,
    },
    /// Invalid queue timing.
    InvalidQueue {
        /// Error description.
        message: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTable { message } => write!(f, "invalid table: {message}"),
            Self::InvalidSettings { message } => write!(f, "invalid settings: {message}"),
            Self::InvalidQueue { message } => write!(f, "invalid queue config: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {}
