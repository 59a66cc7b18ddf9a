//! Storage abstraction for the spool.
//!
//! The trait works on whole files: the spool writes each batch once, reads
//! it back whole and never updates it in place. Checksums and naming are
//! handled by the spool itself.

mod simulated;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{SpoolError, SpoolResult};

pub use simulated::{FaultConfig, SimulatedStorage};

/// Storage backend for spool directories.
///
/// Implementations must be `Send + Sync` for use across async tasks.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Creates or truncates `path`, writes `data` and syncs it to disk.
    ///
    /// # Errors
    /// Returns an error if the write or the sync fails.
    async fn write_file(&self, path: &Path, data: &[u8]) -> SpoolResult<()>;

    /// Reads the entire file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read.
    async fn read_file(&self, path: &Path) -> SpoolResult<Bytes>;

    /// Atomically renames a file.
    ///
    /// # Errors
    /// Returns an error if the rename fails.
    async fn rename(&self, from: &Path, to: &Path) -> SpoolResult<()>;

    /// Syncs a directory so that renames and removals inside it are durable.
    ///
    /// # Errors
    /// Returns an error if the sync fails.
    async fn sync_dir(&self, dir: &Path) -> SpoolResult<()>;

    /// Lists files in `dir` with the given extension, sorted by name.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read.
    async fn list_files(&self, dir: &Path, extension: &str) -> SpoolResult<Vec<PathBuf>>;

    /// Lists subdirectories of `dir`, sorted by name.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read.
    async fn list_dirs(&self, dir: &Path) -> SpoolResult<Vec<PathBuf>>;

    /// Removes a file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be removed.
    async fn remove(&self, path: &Path) -> SpoolResult<()>;

    /// Checks if a path exists.
    async fn exists(&self, path: &Path) -> SpoolResult<bool>;

    /// Creates a directory and all parent directories.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    async fn create_dir_all(&self, path: &Path) -> SpoolResult<()>;
}

/// Tokio-based file storage implementation.
///
/// Uses `tokio::fs`, which runs blocking file operations on the blocking
/// thread pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioStorage;

impl TokioStorage {
    /// Creates a new Tokio storage instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Storage for TokioStorage {
    async fn write_file(&self, path: &Path, data: &[u8]) -> SpoolResult<()> {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| SpoolError::io("create", e))?;
        file.write_all(data)
            .await
            .map_err(|e| SpoolError::io("write", e))?;
        file.sync_all()
            .await
            .map_err(|e| SpoolError::io("fsync", e))
    }

    async fn read_file(&self, path: &Path) -> SpoolResult<Bytes> {
        tokio::fs::read(path)
            .await
            .map(Bytes::from)
            .map_err(|e| SpoolError::io("read", e))
    }

    async fn rename(&self, from: &Path, to: &Path) -> SpoolResult<()> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| SpoolError::io("rename", e))
    }

    async fn sync_dir(&self, dir: &Path) -> SpoolResult<()> {
        let handle = tokio::fs::File::open(dir)
            .await
            .map_err(|e| SpoolError::io("open_dir", e))?;
        handle
            .sync_all()
            .await
            .map_err(|e| SpoolError::io("fsync_dir", e))
    }

    async fn list_files(&self, dir: &Path, extension: &str) -> SpoolResult<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| SpoolError::io("read_dir", e))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SpoolError::io("read_dir_entry", e))?
        {
            let path = entry.path();
            let is_file = entry
                .file_type()
                .await
                .map_err(|e| SpoolError::io("file_type", e))?
                .is_file();
            if is_file && path.extension().is_some_and(|ext| ext == extension) {
                files.push(path);
            }
        }

        // Sort by filename for deterministic ordering.
        files.sort();
        Ok(files)
    }

    async fn list_dirs(&self, dir: &Path) -> SpoolResult<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| SpoolError::io("read_dir", e))?;

        let mut dirs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SpoolError::io("read_dir_entry", e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| SpoolError::io("file_type", e))?
                .is_dir();
            if is_dir {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    async fn remove(&self, path: &Path) -> SpoolResult<()> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| SpoolError::io("remove", e))
    }

    async fn exists(&self, path: &Path) -> SpoolResult<bool> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| SpoolError::io("exists", e))
    }

    async fn create_dir_all(&self, path: &Path) -> SpoolResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| SpoolError::io("create_dir_all", e))
    }
}
