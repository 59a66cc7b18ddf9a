//! Transport to remote shards.
//!
//! The transport carries two kinds of traffic: rewritten queries for the
//! read path and insert batches drained from replication queues. Each call
//! targets one replica; failover across replicas is the caller's job.
//!
//! Production deployments plug in a network client. Tests use
//! [`SimulatedTransport`], which backs every endpoint with an
//! [`InMemoryStorage`] and can script failures per endpoint.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use fathom_core::{Block, InsertQuery, TableRef};
use fathom_routing::Endpoint;

use crate::error::{DistError, DistResult};
use crate::fanout::ShardRequest;
use crate::storage::InMemoryStorage;
use crate::stream::{block_stream, BlockStream};

/// Client side of the inter-node protocol.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends a rewritten query to a replica and returns its result stream.
    ///
    /// # Errors
    /// Returns `Connection` if the replica cannot be reached, or any error
    /// the replica reports before streaming starts.
    async fn send_query(&self, endpoint: &Endpoint, request: ShardRequest) -> DistResult<BlockStream>;

    /// Delivers one insert batch to a replica.
    ///
    /// # Errors
    /// Returns an error if the replica did not acknowledge the batch.
    async fn send_batch(&self, endpoint: &Endpoint, insert: &InsertQuery, block: &Block) -> DistResult<()>;
}

// -----------------------------------------------------------------------------
// Simulated Transport
// -----------------------------------------------------------------------------

/// Canned reply for queries sent to an endpoint.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Stream these blocks.
    Rows(Vec<Block>),
    /// Start streaming, then fail with this message.
    StreamError(String),
    /// Refuse the connection.
    ConnectionRefused,
    /// Accept the query and never produce a block.
    Hang,
    /// Panic inside the request.
    Panic(String),
}

/// A batch acknowledged by a simulated replica.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredBatch {
    /// Replica that acknowledged the batch.
    pub endpoint: Endpoint,
    /// Table the batch was inserted into.
    pub target: TableRef,
    /// Rows of the batch.
    pub block: Block,
}

#[derive(Debug, Default)]
struct State {
    nodes: HashMap<Endpoint, InMemoryStorage>,
    down: HashSet<Endpoint>,
    scripts: HashMap<Endpoint, ScriptedResponse>,
    queries: Vec<(Endpoint, ShardRequest)>,
    delivered: Vec<DeliveredBatch>,
    force_batch_failures: u32,
    batch_fail_rate: f64,
    counter: u64,
}

/// In-process transport for tests and simulations.
///
/// Clones share state.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    seed: u64,
    state: Arc<Mutex<State>>,
}

impl SimulatedTransport {
    /// Creates a transport with no endpoints.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("transport lock poisoned")
    }

    /// Registers an endpoint backed by the given storage.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    pub fn add_node(&self, endpoint: Endpoint, storage: InMemoryStorage) {
        self.lock().nodes.insert(endpoint, storage);
    }

    /// Returns the storage behind an endpoint, creating it on first use.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn node(&self, endpoint: &Endpoint) -> InMemoryStorage {
        self.lock().nodes.entry(endpoint.clone()).or_default().clone()
    }

    /// Marks an endpoint unreachable (or reachable again).
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    pub fn set_down(&self, endpoint: &Endpoint, down: bool) {
        let mut state = self.lock();
        if down {
            state.down.insert(endpoint.clone());
        } else {
            state.down.remove(endpoint);
        }
    }

    /// Scripts the reply to every query sent to an endpoint.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    pub fn script(&self, endpoint: &Endpoint, response: ScriptedResponse) {
        self.lock().scripts.insert(endpoint.clone(), response);
    }

    /// Makes the next `count` batch deliveries fail.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    pub fn fail_next_batches(&self, count: u32) {
        self.lock().force_batch_failures = count;
    }

    /// Sets the probability that a batch delivery fails.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    pub fn set_batch_fail_rate(&self, rate: f64) {
        self.lock().batch_fail_rate = rate;
    }

    /// Returns every query sent so far, with its endpoint.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn queries(&self) -> Vec<(Endpoint, ShardRequest)> {
        self.lock().queries.clone()
    }

    /// Returns every acknowledged batch, in delivery order.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn delivered(&self) -> Vec<DeliveredBatch> {
        self.lock().delivered.clone()
    }

    fn should_fail(&self, state: &mut State) -> bool {
        if state.force_batch_failures > 0 {
            state.force_batch_failures -= 1;
            return true;
        }
        if state.batch_fail_rate <= 0.0 {
            return false;
        }
        state.counter += 1;
        let hash = self
            .seed
            .wrapping_add(state.counter)
            .wrapping_mul(0x5851_f42d_4c95_7f2d);
        #[allow(clippy::cast_precision_loss)]
        let threshold = (state.batch_fail_rate * u64::MAX as f64) as u64;
        hash < threshold
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn send_query(&self, endpoint: &Endpoint, request: ShardRequest) -> DistResult<BlockStream> {
        let (script, storage) = {
            let mut state = self.lock();
            state.queries.push((endpoint.clone(), request.clone()));
            if state.down.contains(endpoint) {
                return Err(DistError::connection(endpoint, "connection refused"));
            }
            let script = state.scripts.get(endpoint).cloned();
            let storage = state.nodes.entry(endpoint.clone()).or_default().clone();
            (script, storage)
        };

        match script {
            None => {
                let target = request.query.target().clone();
                Ok(block_stream(storage.execute(&target, request)?))
            }
            Some(ScriptedResponse::Rows(blocks)) => Ok(block_stream(blocks)),
            Some(ScriptedResponse::StreamError(message)) => {
                let failed: DistResult<Block> = Err(DistError::storage("read", message));
                Ok(Box::pin(futures::stream::iter(vec![failed])))
            }
            Some(ScriptedResponse::ConnectionRefused) => {
                Err(DistError::connection(endpoint, "connection refused"))
            }
            Some(ScriptedResponse::Hang) => Ok(Box::pin(futures::stream::pending::<DistResult<Block>>())),
            Some(ScriptedResponse::Panic(message)) => panic!("{message}"),
        }
    }

    async fn send_batch(&self, endpoint: &Endpoint, insert: &InsertQuery, block: &Block) -> DistResult<()> {
        let storage = {
            let mut state = self.lock();
            if state.down.contains(endpoint) {
                return Err(DistError::connection(endpoint, "connection refused"));
            }
            if self.should_fail(&mut state) {
                return Err(DistError::DeliveryFailure {
                    endpoint: endpoint.to_string(),
                    message: "simulated delivery failure".to_string(),
                });
            }
            state.nodes.entry(endpoint.clone()).or_default().clone()
        };

        storage.append(&insert.target, block.clone())?;
        self.lock().delivered.push(DeliveredBatch {
            endpoint: endpoint.clone(),
            target: insert.target.clone(),
            block: block.clone(),
        });
        Ok(())
    }
}
