//! Cluster topology.
//!
//! A cluster is an ordered list of shards. Each shard has a write weight
//! and replicas that are either local (served by this process) or remote
//! (reached over the transport). A shard with at least one local replica
//! is a local shard.
//!
//! Writes pick a shard through weighted slots: every shard owns `weight`
//! consecutive slots, in shard order, and a row with key `k` lands in slot
//! `k mod total_weight`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use fathom_core::ShardNum;

use crate::error::{RoutingError, RoutingResult};
use crate::limits::{SHARDS_COUNT_MAX, SLOTS_COUNT_MAX};

/// Network address of a replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// Port.
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Configuration of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardConfig {
    /// Write weight.
    pub weight: u32,
    /// Replicas served by this process.
    pub local_replicas: Vec<Endpoint>,
    /// Replicas reached over the transport.
    pub remote_replicas: Vec<Endpoint>,
}

impl ShardConfig {
    /// Creates a shard with weight 1 and no replicas.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            weight: 1,
            local_replicas: Vec::new(),
            remote_replicas: Vec::new(),
        }
    }

    /// Creates a shard served only by this process.
    #[must_use]
    pub fn local(endpoint: Endpoint) -> Self {
        Self::new().with_local_replica(endpoint)
    }

    /// Creates a shard with remote replicas only.
    #[must_use]
    pub fn remote(replicas: Vec<Endpoint>) -> Self {
        Self {
            remote_replicas: replicas,
            ..Self::new()
        }
    }

    /// Sets the weight.
    #[must_use]
    pub const fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Adds a local replica.
    #[must_use]
    pub fn with_local_replica(mut self, endpoint: Endpoint) -> Self {
        self.local_replicas.push(endpoint);
        self
    }

    /// Adds a remote replica.
    #[must_use]
    pub fn with_remote_replica(mut self, endpoint: Endpoint) -> Self {
        self.remote_replicas.push(endpoint);
        self
    }
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A validated shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    index: u32,
    weight: u32,
    local_replicas: Vec<Endpoint>,
    remote_replicas: Vec<Endpoint>,
}

impl Shard {
    /// Zero-based position in the cluster.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// One-based shard number.
    #[must_use]
    pub const fn shard_num(&self) -> ShardNum {
        ShardNum::new(self.index as u64 + 1)
    }

    /// Write weight.
    #[must_use]
    pub const fn weight(&self) -> u32 {
        self.weight
    }

    /// Replicas served by this process.
    #[must_use]
    pub fn local_replicas(&self) -> &[Endpoint] {
        &self.local_replicas
    }

    /// Replicas reached over the transport.
    #[must_use]
    pub fn remote_replicas(&self) -> &[Endpoint] {
        &self.remote_replicas
    }

    /// Returns true if this process serves the shard.
    #[must_use]
    pub fn is_local(&self) -> bool {
        !self.local_replicas.is_empty()
    }
}

/// A validated, immutable cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    name: String,
    shards: Vec<Shard>,
    /// Slot -> shard position.
    slots: Vec<u32>,
    local_shard_count: u32,
    remote_shard_count: u32,
}

impl Cluster {
    /// Validates shard configurations and builds a cluster.
    ///
    /// # Errors
    /// Returns `InvalidCluster` if there are no shards, too many shards, a
    /// shard without replicas, or a total weight of zero or above the slot
    /// limit.
    pub fn new(name: impl Into<String>, configs: Vec<ShardConfig>) -> RoutingResult<Self> {
        let name = name.into();
        let invalid = |reason: String| RoutingError::InvalidCluster {
            cluster: name.clone(),
            reason,
        };

        if configs.is_empty() {
            return Err(invalid("no shards".to_string()));
        }
        if configs.len() > SHARDS_COUNT_MAX {
            return Err(invalid(format!(
                "{} shards exceeds max {SHARDS_COUNT_MAX}",
                configs.len()
            )));
        }

        let total_weight: u64 = configs.iter().map(|c| u64::from(c.weight)).sum();
        if total_weight == 0 {
            return Err(invalid("total shard weight is zero".to_string()));
        }
        if total_weight > SLOTS_COUNT_MAX {
            return Err(invalid(format!(
                "total shard weight {total_weight} exceeds max {SLOTS_COUNT_MAX}"
            )));
        }

        let mut shards = Vec::with_capacity(configs.len());
        let mut slots = Vec::new();
        for (position, config) in configs.into_iter().enumerate() {
            if config.local_replicas.is_empty() && config.remote_replicas.is_empty() {
                return Err(invalid(format!("shard {} has no replicas", position + 1)));
            }
            #[allow(clippy::cast_possible_truncation)] // Bounded by SHARDS_COUNT_MAX.
            let index = position as u32;
            slots.extend(std::iter::repeat(index).take(config.weight as usize));
            shards.push(Shard {
                index,
                weight: config.weight,
                local_replicas: config.local_replicas,
                remote_replicas: config.remote_replicas,
            });
        }

        #[allow(clippy::cast_possible_truncation)] // Bounded by SHARDS_COUNT_MAX.
        let local_shard_count = shards.iter().filter(|s| s.is_local()).count() as u32;
        #[allow(clippy::cast_possible_truncation)]
        let remote_shard_count = shards.len() as u32 - local_shard_count;

        // TigerStyle: Assert postconditions.
        assert_eq!(slots.len() as u64, total_weight);

        Ok(Self {
            name,
            shards,
            slots,
            local_shard_count,
            remote_shard_count,
        })
    }

    /// Cluster name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shards in configuration order.
    #[must_use]
    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Number of shards served by this process.
    #[must_use]
    pub const fn local_shard_count(&self) -> u32 {
        self.local_shard_count
    }

    /// Number of shards reached over the transport.
    #[must_use]
    pub const fn remote_shard_count(&self) -> u32 {
        self.remote_shard_count
    }

    /// Sum of shard weights.
    #[must_use]
    pub fn total_weight(&self) -> u64 {
        self.slots.len() as u64
    }

    /// Returns the position of the shard that owns `key`.
    #[must_use]
    pub fn shard_index_for_key(&self, key: u64) -> usize {
        #[allow(clippy::cast_possible_truncation)] // Slot count bounded by SLOTS_COUNT_MAX.
        let slot = (key % self.total_weight()) as usize;
        self.slots[slot] as usize
    }

    /// Textual description handed to the resharding coordinator.
    #[must_use]
    pub fn descriptor(&self) -> String {
        let shards: Vec<String> = self
            .shards
            .iter()
            .map(|shard| {
                let replicas: Vec<String> = shard
                    .local_replicas
                    .iter()
                    .chain(&shard.remote_replicas)
                    .map(ToString::to_string)
                    .collect();
                format!("{}*[{}]", shard.weight, replicas.join(","))
            })
            .collect();
        format!("{}:{}", self.name, shards.join(";"))
    }
}

/// Named clusters known to this process.
#[derive(Debug, Clone, Default)]
pub struct Clusters {
    clusters: HashMap<String, Arc<Cluster>>,
}

impl Clusters {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a cluster. Replacement swaps the whole cluster;
    /// tables built from the old one keep using it.
    pub fn insert(&mut self, cluster: Cluster) {
        self.clusters
            .insert(cluster.name().to_string(), Arc::new(cluster));
    }

    /// Looks up a cluster by name.
    ///
    /// # Errors
    /// Returns `ClusterNotFound` if no cluster has this name.
    pub fn get(&self, name: &str) -> RoutingResult<Arc<Cluster>> {
        self.clusters
            .get(name)
            .cloned()
            .ok_or_else(|| RoutingError::ClusterNotFound {
                name: name.to_string(),
            })
    }
}
