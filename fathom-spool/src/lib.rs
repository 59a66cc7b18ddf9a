//! Fathom Spool - durable per-shard spool of pending insert batches.
//!
//! Every batch is stored as its own checksummed file. Files are named by a
//! zero-padded sequence number so that directory order equals write order,
//! and a batch only becomes visible once it has been fully written and
//! synced.
//!
//! # Design Principles (`TigerStyle`)
//!
//! - **Crash safety**: A batch is durable before `append` returns
//! - **Checksums**: CRC32 on every entry to detect corruption
//! - **FIFO**: Entries are consumed strictly in sequence order
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod entry;
mod error;
mod spool;
mod storage;

pub use entry::{EntryHeader, SpoolEntry, ENTRY_HEADER_SIZE};
pub use error::{SpoolError, SpoolResult};
pub use spool::{PendingEntry, Spool, SpoolConfig, SpoolSummary, BROKEN_DIR, ENTRY_EXTENSION, TMP_DIR};
pub use storage::{FaultConfig, SimulatedStorage, Storage, TokioStorage};

/// Spool limits.
pub mod limits {
    /// Maximum size of a single entry payload in bytes (64 MB).
    pub const ENTRY_PAYLOAD_SIZE_BYTES_MAX: u32 = 64 * 1024 * 1024;
}
