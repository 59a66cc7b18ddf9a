//! Durable per-shard replication queue.
//!
//! Inserts destined for a remote shard are spooled to disk and delivered
//! by one background worker per shard, oldest first. An entry is deleted
//! only after a replica acknowledged it, so delivery is at least once and
//! survives restarts.
//!
//! # State Machine
//!
//! ```text
//! Idle -> Draining -> Delivered -> Idle
//!                  -> Failed -> Backoff -> Draining
//! ```
//!
//! A failed entry blocks the entries behind it; the worker retries it
//! with exponential backoff. Entries that fail verification are moved to
//! `broken/` instead.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fathom_core::{Block, CoreError, CoreResult, InsertQuery, TableRef};
use fathom_routing::Endpoint;
use fathom_spool::{PendingEntry, Spool, SpoolConfig, Storage};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{DistError, DistResult};
use crate::transport::Transport;

// -----------------------------------------------------------------------------
// QueueState
// -----------------------------------------------------------------------------

/// Observable state of a queue worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueState {
    /// Nothing to deliver.
    Idle = 0,
    /// Delivering the oldest entry.
    Draining = 1,
    /// The last entry was delivered and removed.
    Delivered = 2,
    /// The last delivery failed.
    Failed = 3,
    /// Waiting before retrying.
    Backoff = 4,
}

impl QueueState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Draining,
            2 => Self::Delivered,
            3 => Self::Failed,
            4 => Self::Backoff,
            _ => Self::Idle,
        }
    }
}

// -----------------------------------------------------------------------------
// QueuedBatch
// -----------------------------------------------------------------------------

/// Payload of one spool entry: the insert target and its rows.
///
/// Layout: `db_len: u32 | db | table_len: u32 | table | block`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedBatch {
    /// Table on the remote shard.
    pub target: TableRef,
    /// Rows to insert.
    pub block: Block,
}

impl QueuedBatch {
    /// Encodes the batch.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.target.database);
        put_str(&mut buf, &self.target.table);
        self.block.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes a batch.
    ///
    /// # Errors
    /// Returns `Decode` if the payload is truncated or malformed.
    pub fn decode(mut payload: Bytes) -> CoreResult<Self> {
        let database = get_str(&mut payload)?;
        let table = get_str(&mut payload)?;
        let block = Block::decode(&mut payload)?;
        if payload.has_remaining() {
            return Err(CoreError::Decode {
                reason: "trailing bytes after block",
            });
        }
        Ok(Self {
            target: TableRef::new(database, table),
            block,
        })
    }

    /// INSERT statement replayed on the replica.
    #[must_use]
    pub fn insert(&self) -> InsertQuery {
        InsertQuery::new(self.target.clone(), self.block.columns().to_vec())
    }
}

#[allow(clippy::cast_possible_truncation)] // Identifiers are bounded by IDENTIFIER_LENGTH_MAX.
fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut Bytes) -> CoreResult<String> {
    if buf.remaining() < 4 {
        return Err(CoreError::Decode {
            reason: "truncated identifier length",
        });
    }
    let len = buf.get_u32_le() as usize;
    if len > fathom_core::limits::IDENTIFIER_LENGTH_MAX || buf.remaining() < len {
        return Err(CoreError::Decode {
            reason: "invalid identifier length",
        });
    }
    String::from_utf8(buf.split_to(len).to_vec()).map_err(|_| CoreError::Decode {
        reason: "identifier is not utf-8",
    })
}

// -----------------------------------------------------------------------------
// ReplicationQueue
// -----------------------------------------------------------------------------

/// Counters and state shared with the worker.
#[derive(Debug, Default)]
struct Shared {
    state: AtomicU8,
    delivered: AtomicU64,
    failures: AtomicU64,
    quarantined: AtomicU64,
    notify: Notify,
}

impl Shared {
    fn set_state(&self, state: QueueState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Point-in-time statistics of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Queue (directory) name.
    pub name: String,
    /// Worker state.
    pub state: QueueState,
    /// Entries waiting for delivery.
    pub pending: u64,
    /// Entries delivered since the queue was opened.
    pub delivered: u64,
    /// Failed delivery attempts since the queue was opened.
    pub failures: u64,
    /// Entries moved to `broken/` since the queue was opened.
    pub quarantined: u64,
}

/// Durable, ordered queue of insert batches for one remote shard.
pub struct ReplicationQueue<S: Storage> {
    name: String,
    spool: Arc<Spool<S>>,
    shared: Arc<Shared>,
    shutdown_tx: mpsc::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Storage> std::fmt::Debug for ReplicationQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationQueue")
            .field("name", &self.name)
            .field("dir", &self.spool.dir())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<S: Storage> ReplicationQueue<S> {
    /// Opens the queue stored in `dir` and starts its worker.
    ///
    /// Entries left by a previous run are delivered first.
    ///
    /// # Errors
    /// Returns an error if the spool cannot be opened.
    pub async fn open(
        name: impl Into<String>,
        dir: PathBuf,
        replicas: Vec<Endpoint>,
        storage: Arc<S>,
        transport: Arc<dyn Transport>,
        config: QueueConfig,
    ) -> DistResult<Self> {
        let name = name.into();
        if replicas.is_empty() {
            return Err(DistError::configuration(format!(
                "replication queue {name} has no replicas"
            )));
        }
        config.validate()?;

        let spool = Arc::new(Spool::open(storage, SpoolConfig::new(dir)).await?);
        let shared = Arc::new(Shared::default());
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let worker = Worker {
            name: name.clone(),
            replicas,
            spool: Arc::clone(&spool),
            shared: Arc::clone(&shared),
            transport,
            config,
        };
        let handle = tokio::spawn(worker.run(shutdown_rx));
        info!(queue = %name, dir = %spool.dir().display(), "started replication queue");

        Ok(Self {
            name,
            spool,
            shared,
            shutdown_tx,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spool directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.spool.dir()
    }

    /// Durably appends a batch and wakes the worker.
    ///
    /// Never touches the network.
    ///
    /// # Errors
    /// Returns an error if the batch could not be made durable.
    pub async fn enqueue(&self, insert: &InsertQuery, block: Block) -> DistResult<()> {
        let rows = block.num_rows();
        let batch = QueuedBatch {
            target: insert.target.clone(),
            block,
        };
        let seq = self.spool.append(batch.encode()).await?;
        self.shared.notify.notify_one();
        debug!(queue = %self.name, seq = seq.get(), rows, "enqueued batch");
        Ok(())
    }

    /// Current worker state.
    #[must_use]
    pub fn state(&self) -> QueueState {
        QueueState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Number of entries waiting for delivery.
    ///
    /// # Errors
    /// Returns an error if the spool cannot be read.
    pub async fn pending(&self) -> DistResult<u64> {
        Ok(self.spool.pending().await?.len() as u64)
    }

    /// Entries delivered since the queue was opened.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Failed delivery attempts since the queue was opened.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }

    /// Snapshot of all counters.
    ///
    /// # Errors
    /// Returns an error if the spool cannot be read.
    pub async fn stats(&self) -> DistResult<QueueStats> {
        Ok(QueueStats {
            name: self.name.clone(),
            state: self.state(),
            pending: self.pending().await?,
            delivered: self.delivered(),
            failures: self.failures(),
            quarantined: self.shared.quarantined.load(Ordering::Relaxed),
        })
    }

    /// Stops the worker between delivery attempts. Pending entries stay
    /// on disk.
    pub async fn shutdown(&self) {
        // Full or closed both mean the worker is already stopping.
        let _ = self.shutdown_tx.try_send(());
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(queue = %self.name, error = %e, "replication queue worker panicked");
            }
        }
        info!(queue = %self.name, "stopped replication queue");
    }
}

// -----------------------------------------------------------------------------
// Worker
// -----------------------------------------------------------------------------

enum Outcome {
    Delivered,
    Quarantined,
}

struct Worker<S: Storage> {
    name: String,
    replicas: Vec<Endpoint>,
    spool: Arc<Spool<S>>,
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    config: QueueConfig,
}

impl<S: Storage> Worker<S> {
    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut backoff = self.config.initial_backoff;

        loop {
            if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }

            let result = match self.spool.oldest().await {
                Ok(None) => {
                    self.shared.set_state(QueueState::Idle);
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        () = self.shared.notify.notified() => continue,
                    }
                }
                Ok(Some(pending)) => {
                    self.shared.set_state(QueueState::Draining);
                    self.process(&pending).await
                }
                Err(e) => Err(e.into()),
            };

            match result {
                Ok(Outcome::Delivered) => {
                    self.shared.delivered.fetch_add(1, Ordering::Relaxed);
                    self.shared.set_state(QueueState::Delivered);
                    backoff = self.config.initial_backoff;
                }
                Ok(Outcome::Quarantined) => {
                    self.shared.quarantined.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.shared.failures.fetch_add(1, Ordering::Relaxed);
                    self.shared.set_state(QueueState::Failed);
                    let delay = self.config.jittered(backoff);
                    warn!(
                        queue = %self.name,
                        error = %e,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "delivery failed"
                    );

                    self.shared.set_state(QueueState::Backoff);
                    if self.sleep_or_shutdown(delay, &mut shutdown_rx).await {
                        break;
                    }
                    backoff = self.config.next_backoff(backoff);
                }
            }
        }
        debug!(queue = %self.name, "replication queue worker exiting");
    }

    /// Returns true if shutdown was requested while sleeping.
    async fn sleep_or_shutdown(&self, delay: Duration, shutdown_rx: &mut mpsc::Receiver<()>) -> bool {
        tokio::select! {
            _ = shutdown_rx.recv() => true,
            () = tokio::time::sleep(delay) => false,
        }
    }

    async fn process(&self, pending: &PendingEntry) -> DistResult<Outcome> {
        let entry = match self.spool.read(pending).await {
            Ok(entry) => entry,
            Err(e) if e.is_corruption() => {
                error!(queue = %self.name, seq = pending.seq.get(), error = %e, "corrupt spool entry");
                self.spool.quarantine(pending).await?;
                return Ok(Outcome::Quarantined);
            }
            Err(e) => return Err(e.into()),
        };

        let batch = match QueuedBatch::decode(entry.payload) {
            Ok(batch) => batch,
            Err(e) => {
                error!(queue = %self.name, seq = pending.seq.get(), error = %e, "undecodable spool entry");
                self.spool.quarantine(pending).await?;
                return Ok(Outcome::Quarantined);
            }
        };

        self.deliver(&batch).await?;
        self.spool.remove(pending).await?;
        debug!(
            queue = %self.name,
            seq = pending.seq.get(),
            rows = batch.block.num_rows(),
            "delivered batch"
        );
        Ok(Outcome::Delivered)
    }

    /// Sends a batch to the first replica that accepts a connection.
    async fn deliver(&self, batch: &QueuedBatch) -> DistResult<()> {
        let insert = batch.insert();
        let mut last_error = None;
        for endpoint in &self.replicas {
            match self.transport.send_batch(endpoint, &insert, &batch.block).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_connection_failure() => {
                    debug!(queue = %self.name, endpoint = %endpoint, error = %e, "replica unreachable");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| DistError::configuration("no replicas")))
    }
}
