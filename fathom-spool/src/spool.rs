//! Per-shard spool directory.
//!
//! # File Layout
//!
//! ```text
//! /spool-dir/
//!   00000000000000000001.bin   # oldest pending batch
//!   00000000000000000002.bin
//!   tmp/                       # batches being written, never consumed
//!   broken/                    # quarantined entries that failed verification
//! ```
//!
//! An append writes the entry into `tmp/`, syncs it, renames it into the
//! spool directory and syncs the directory. A crash at any point leaves
//! either no visible entry or a complete one. Leftovers in `tmp/` are
//! discarded on open.
//!
//! [`Spool::inspect`] opens a directory without touching it, for tools that
//! look at a spool owned by a running server.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use fathom_core::BatchSeq;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::entry::SpoolEntry;
use crate::error::{SpoolError, SpoolResult};
use crate::storage::Storage;

/// Extension of entry files.
pub const ENTRY_EXTENSION: &str = "bin";

/// Subdirectory holding partially written entries.
pub const TMP_DIR: &str = "tmp";

/// Subdirectory holding quarantined entries.
pub const BROKEN_DIR: &str = "broken";

/// Spool configuration.
#[derive(Debug, Clone)]
pub struct SpoolConfig {
    /// Spool directory.
    pub dir: PathBuf,
}

impl SpoolConfig {
    /// Creates a configuration for a spool directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

/// A pending entry file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Sequence number parsed from the file name.
    pub seq: BatchSeq,
    /// Full path of the file.
    pub path: PathBuf,
}

/// Snapshot of a spool's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpoolSummary {
    /// Number of pending entries.
    pub pending: u64,
    /// Oldest pending sequence number.
    pub first: Option<BatchSeq>,
    /// Newest pending sequence number.
    pub last: Option<BatchSeq>,
    /// Number of quarantined entries.
    pub broken: u64,
}

/// Durable FIFO of opaque batches in one directory.
///
/// Appends are serialized so that entries become visible in sequence order.
/// Consumption (`oldest`, `read`, `remove`, `quarantine`) is expected to be
/// driven by a single worker.
pub struct Spool<S: Storage> {
    storage: Arc<S>,
    config: SpoolConfig,
    /// Next sequence number; the lock also serializes appends.
    next_seq: Mutex<BatchSeq>,
    read_only: bool,
}

impl<S: Storage> Spool<S> {
    /// Opens or creates a spool directory.
    ///
    /// Discards partially written entries and resumes numbering after the
    /// highest sequence found among pending and quarantined entries.
    ///
    /// # Errors
    /// Returns an error if the directories cannot be created or scanned.
    pub async fn open(storage: Arc<S>, config: SpoolConfig) -> SpoolResult<Self> {
        let tmp_dir = config.dir.join(TMP_DIR);
        let broken_dir = config.dir.join(BROKEN_DIR);
        storage.create_dir_all(&tmp_dir).await?;
        storage.create_dir_all(&broken_dir).await?;

        for leftover in storage.list_files(&tmp_dir, ENTRY_EXTENSION).await? {
            warn!(path = %leftover.display(), "discarding partially written spool entry");
            storage.remove(&leftover).await?;
        }

        let max_seq = max_seq_in(storage.as_ref(), &config.dir).await?;
        info!(
            dir = %config.dir.display(),
            next_seq = max_seq.next().get(),
            "opened spool"
        );

        Ok(Self {
            storage,
            next_seq: Mutex::new(max_seq.next()),
            config,
            read_only: false,
        })
    }

    /// Opens an existing spool directory for reading only.
    ///
    /// Nothing on disk is created, removed or renamed, so this is safe to
    /// run next to the server that owns the spool. `append`, `remove` and
    /// `quarantine` fail with [`SpoolError::ReadOnly`].
    ///
    /// # Errors
    /// Returns an error if the directory cannot be scanned.
    pub async fn inspect(storage: Arc<S>, config: SpoolConfig) -> SpoolResult<Self> {
        let max_seq = max_seq_in(storage.as_ref(), &config.dir).await?;
        Ok(Self {
            storage,
            next_seq: Mutex::new(max_seq.next()),
            config,
            read_only: true,
        })
    }

    /// Returns true if the spool was opened with [`Spool::inspect`].
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn check_writable(&self) -> SpoolResult<()> {
        if self.read_only {
            return Err(SpoolError::ReadOnly {
                dir: self.config.dir.display().to_string(),
            });
        }
        Ok(())
    }

    /// Returns the spool directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Appends a batch. The entry is durable when this returns.
    ///
    /// # Errors
    /// Returns an error if the payload is too large or any write, rename or
    /// sync fails. If the write or rename fails, no entry becomes visible
    /// and the sequence number is not consumed. If only the final directory
    /// sync fails, the entry is visible and may still be delivered; its
    /// sequence number stays consumed.
    pub async fn append(&self, payload: Bytes) -> SpoolResult<BatchSeq> {
        self.check_writable()?;
        let mut next_seq = self.next_seq.lock().await;
        let seq = *next_seq;
        let entry = SpoolEntry::new(seq, payload)?;

        let name = entry_file_name(seq);
        let tmp_path = self.config.dir.join(TMP_DIR).join(&name);
        let final_path = self.config.dir.join(&name);

        self.storage.write_file(&tmp_path, &entry.encode()).await?;
        if let Err(e) = self.storage.rename(&tmp_path, &final_path).await {
            // Best effort: open() discards tmp leftovers anyway.
            let _ = self.storage.remove(&tmp_path).await;
            return Err(e);
        }
        // Visible from here on: the number must never be handed out again.
        *next_seq = seq.next();
        drop(next_seq);
        self.storage.sync_dir(&self.config.dir).await?;

        debug!(dir = %self.config.dir.display(), seq = seq.get(), "spooled batch");
        Ok(seq)
    }

    /// Lists pending entries, oldest first.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read.
    pub async fn pending(&self) -> SpoolResult<Vec<PendingEntry>> {
        let files = self
            .storage
            .list_files(&self.config.dir, ENTRY_EXTENSION)
            .await?;
        let mut entries: Vec<PendingEntry> = files
            .into_iter()
            .filter_map(|path| match parse_seq(&path) {
                Some(seq) => Some(PendingEntry { seq, path }),
                None => {
                    warn!(path = %path.display(), "ignoring unrecognized file in spool");
                    None
                }
            })
            .collect();
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    /// Returns the oldest pending entry.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read.
    pub async fn oldest(&self) -> SpoolResult<Option<PendingEntry>> {
        Ok(self.pending().await?.into_iter().next())
    }

    /// Reads and verifies a pending entry.
    ///
    /// # Errors
    /// Returns an I/O error if the file cannot be read, or a corruption
    /// error if verification fails.
    pub async fn read(&self, pending: &PendingEntry) -> SpoolResult<SpoolEntry> {
        let data = self.storage.read_file(&pending.path).await?;
        let file = pending.path.display().to_string();
        let entry = SpoolEntry::decode(data, &file)?;
        if entry.seq() != pending.seq {
            return Err(SpoolError::InvalidEntry {
                file,
                reason: "sequence does not match file name",
            });
        }
        Ok(entry)
    }

    /// Deletes a delivered entry.
    ///
    /// # Errors
    /// Returns an error if the file cannot be removed.
    pub async fn remove(&self, pending: &PendingEntry) -> SpoolResult<()> {
        self.check_writable()?;
        self.storage.remove(&pending.path).await?;
        self.storage.sync_dir(&self.config.dir).await
    }

    /// Moves an entry that cannot be delivered into `broken/`.
    ///
    /// # Errors
    /// Returns an error if the rename fails.
    pub async fn quarantine(&self, pending: &PendingEntry) -> SpoolResult<PathBuf> {
        self.check_writable()?;
        let target = self
            .config
            .dir
            .join(BROKEN_DIR)
            .join(entry_file_name(pending.seq));
        self.storage.rename(&pending.path, &target).await?;
        self.storage.sync_dir(&self.config.dir).await?;
        warn!(
            from = %pending.path.display(),
            to = %target.display(),
            "quarantined spool entry"
        );
        Ok(target)
    }

    /// Summarizes pending and quarantined entries.
    ///
    /// # Errors
    /// Returns an error if a directory cannot be read.
    pub async fn summary(&self) -> SpoolResult<SpoolSummary> {
        let pending = self.pending().await?;
        let broken_dir = self.config.dir.join(BROKEN_DIR);
        let broken = list_if_exists(self.storage.as_ref(), &broken_dir).await?;
        Ok(SpoolSummary {
            pending: pending.len() as u64,
            first: pending.first().map(|e| e.seq),
            last: pending.last().map(|e| e.seq),
            broken: broken.len() as u64,
        })
    }
}

/// Highest sequence among pending and quarantined entries, or zero.
async fn max_seq_in<S: Storage>(storage: &S, dir: &Path) -> SpoolResult<BatchSeq> {
    let mut max_seq = BatchSeq::new(0);
    for path in list_if_exists(storage, dir).await? {
        max_seq = max_seq.max(parse_seq(&path).unwrap_or(max_seq));
    }
    for path in list_if_exists(storage, &dir.join(BROKEN_DIR)).await? {
        max_seq = max_seq.max(parse_seq(&path).unwrap_or(max_seq));
    }
    Ok(max_seq)
}

/// Entry files in `dir`; a missing directory has none.
async fn list_if_exists<S: Storage>(storage: &S, dir: &Path) -> SpoolResult<Vec<PathBuf>> {
    if !storage.exists(dir).await? {
        return Ok(Vec::new());
    }
    storage.list_files(dir, ENTRY_EXTENSION).await
}

/// File name of the entry with sequence `seq`.
fn entry_file_name(seq: BatchSeq) -> String {
    format!("{:020}.{ENTRY_EXTENSION}", seq.get())
}

fn parse_seq(path: &Path) -> Option<BatchSeq> {
    path.file_stem()?
        .to_str()?
        .parse::<u64>()
        .ok()
        .filter(|&n| n > 0)
        .map(BatchSeq::new)
}
