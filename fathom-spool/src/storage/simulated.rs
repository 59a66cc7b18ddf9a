//! Simulated in-memory storage with fault injection.
//!
//! Used by tests to exercise spool and queue failure paths without a real
//! disk. Clones share the same files.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use super::Storage;
use crate::error::{SpoolError, SpoolResult};

/// Configuration for fault injection in simulated storage.
#[derive(Debug, Clone, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct FaultConfig {
    /// Probability of a write failing. Range: 0.0 - 1.0.
    pub write_fail_rate: f64,
    /// Probability of a read failing. Range: 0.0 - 1.0.
    pub read_fail_rate: f64,
    /// If true, the next write fails.
    pub force_write_fail: bool,
    /// If true, the next rename fails.
    pub force_rename_fail: bool,
    /// If true, the next read fails.
    pub force_read_fail: bool,
    /// If true, the next read returns data with flipped bits.
    pub force_read_corruption: bool,
    /// If true, the next directory sync fails.
    pub force_sync_dir_fail: bool,
}

impl FaultConfig {
    /// Creates a fault config with no faults.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Sets the write fail rate.
    ///
    /// # Panics
    /// Panics if rate is not in range 0.0..=1.0.
    #[must_use]
    pub fn with_write_fail_rate(mut self, rate: f64) -> Self {
        assert!((0.0..=1.0).contains(&rate), "rate must be in 0.0..=1.0");
        self.write_fail_rate = rate;
        self
    }

    /// Sets the read fail rate.
    ///
    /// # Panics
    /// Panics if rate is not in range 0.0..=1.0.
    #[must_use]
    pub fn with_read_fail_rate(mut self, rate: f64) -> Self {
        assert!((0.0..=1.0).contains(&rate), "rate must be in 0.0..=1.0");
        self.read_fail_rate = rate;
        self
    }

    /// Forces the next write to fail.
    #[must_use]
    pub const fn with_force_write_fail(mut self) -> Self {
        self.force_write_fail = true;
        self
    }

    /// Forces the next rename to fail.
    #[must_use]
    pub const fn with_force_rename_fail(mut self) -> Self {
        self.force_rename_fail = true;
        self
    }

    /// Forces the next directory sync to fail.
    #[must_use]
    pub const fn with_force_sync_dir_fail(mut self) -> Self {
        self.force_sync_dir_fail = true;
        self
    }

    /// Forces the next read to return corrupted data.
    #[must_use]
    pub const fn with_force_read_corruption(mut self) -> Self {
        self.force_read_corruption = true;
        self
    }
}

#[derive(Debug, Default)]
struct Files {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
}

/// In-memory storage with deterministic fault injection.
#[derive(Debug, Clone)]
pub struct SimulatedStorage {
    state: Arc<Mutex<Files>>,
    fault_config: Arc<Mutex<FaultConfig>>,
    seed: u64,
    counter: Arc<AtomicU64>,
}

impl SimulatedStorage {
    /// Creates storage without faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_faults(seed, FaultConfig::none())
    }

    /// Creates storage with fault injection.
    #[must_use]
    pub fn with_faults(seed: u64, config: FaultConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(Files::default())),
            fault_config: Arc::new(Mutex::new(config)),
            seed,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the fault configuration for modification.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    pub fn fault_config(&self) -> MutexGuard<'_, FaultConfig> {
        self.fault_config.lock().expect("fault config lock poisoned")
    }

    /// Returns the raw content of a file.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn raw_content(&self, path: &Path) -> Option<Vec<u8>> {
        self.files().files.get(path).cloned()
    }

    /// Flips all bits of one byte in a file.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    pub fn corrupt_byte(&self, path: &Path, offset: usize) {
        if let Some(content) = self.files().files.get_mut(path) {
            if let Some(byte) = content.get_mut(offset) {
                *byte ^= 0xFF;
            }
        }
    }

    /// Returns the number of stored files.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files().files.len()
    }

    fn files(&self) -> MutexGuard<'_, Files> {
        self.state.lock().expect("storage lock poisoned")
    }

    /// Deterministic fault decision from seed and operation counter.
    fn should_inject_fault(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let hash = self
            .seed
            .wrapping_add(counter)
            .wrapping_mul(0x5851_f42d_4c95_7f2d);
        #[allow(clippy::cast_precision_loss)]
        let normalized = (hash as f64) / (u64::MAX as f64);
        normalized < rate
    }

    fn take_forced(&self, pick: impl FnOnce(&mut FaultConfig) -> &mut bool) -> bool {
        let mut config = self.fault_config();
        let flag = pick(&mut *config);
        std::mem::replace(flag, false)
    }

    fn require_parent(files: &Files, path: &Path, operation: &'static str) -> SpoolResult<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !files.dirs.contains(parent) => {
                Err(SpoolError::io(operation, format!("no such directory: {}", parent.display())))
            }
            _ => Ok(()),
        }
    }
}

// Allow significant_drop_tightening since this is test-only simulation code.
#[allow(clippy::significant_drop_tightening)]
#[async_trait]
impl Storage for SimulatedStorage {
    async fn write_file(&self, path: &Path, data: &[u8]) -> SpoolResult<()> {
        let rate = self.fault_config().write_fail_rate;
        if self.take_forced(|c| &mut c.force_write_fail) || self.should_inject_fault(rate) {
            return Err(SpoolError::io("write", "simulated write failure"));
        }
        let mut files = self.files();
        Self::require_parent(&files, path, "write")?;
        files.files.insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> SpoolResult<Bytes> {
        let rate = self.fault_config().read_fail_rate;
        if self.take_forced(|c| &mut c.force_read_fail) || self.should_inject_fault(rate) {
            return Err(SpoolError::io("read", "simulated read failure"));
        }
        let mut data = self
            .files()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| SpoolError::io("read", format!("not found: {}", path.display())))?;
        if self.take_forced(|c| &mut c.force_read_corruption) && !data.is_empty() {
            let idx = data.len() - 1;
            data[idx] ^= 0xFF;
        }
        Ok(Bytes::from(data))
    }

    async fn rename(&self, from: &Path, to: &Path) -> SpoolResult<()> {
        if self.take_forced(|c| &mut c.force_rename_fail) {
            return Err(SpoolError::io("rename", "simulated rename failure"));
        }
        let mut files = self.files();
        Self::require_parent(&files, to, "rename")?;
        let data = files
            .files
            .remove(from)
            .ok_or_else(|| SpoolError::io("rename", format!("not found: {}", from.display())))?;
        files.files.insert(to.to_path_buf(), data);
        Ok(())
    }

    async fn sync_dir(&self, dir: &Path) -> SpoolResult<()> {
        if self.take_forced(|c| &mut c.force_sync_dir_fail) {
            return Err(SpoolError::io("fsync_dir", "simulated sync failure"));
        }
        if self.files().dirs.contains(dir) {
            Ok(())
        } else {
            Err(SpoolError::io("fsync_dir", format!("no such directory: {}", dir.display())))
        }
    }

    async fn list_files(&self, dir: &Path, extension: &str) -> SpoolResult<Vec<PathBuf>> {
        let files = self.files();
        if !files.dirs.contains(dir) {
            return Err(SpoolError::io("read_dir", format!("no such directory: {}", dir.display())));
        }
        Ok(files
            .files
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .filter(|p| p.extension().is_some_and(|ext| ext == extension))
            .cloned()
            .collect())
    }

    async fn list_dirs(&self, dir: &Path) -> SpoolResult<Vec<PathBuf>> {
        let files = self.files();
        if !files.dirs.contains(dir) {
            return Err(SpoolError::io("read_dir", format!("no such directory: {}", dir.display())));
        }
        Ok(files
            .dirs
            .iter()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect())
    }

    async fn remove(&self, path: &Path) -> SpoolResult<()> {
        self.files()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| SpoolError::io("remove", format!("not found: {}", path.display())))
    }

    async fn exists(&self, path: &Path) -> SpoolResult<bool> {
        let files = self.files();
        Ok(files.files.contains_key(path) || files.dirs.contains(path))
    }

    async fn create_dir_all(&self, path: &Path) -> SpoolResult<()> {
        let mut files = self.files();
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            files.dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forced_write_failure_is_one_shot() {
        let storage = SimulatedStorage::with_faults(7, FaultConfig::none().with_force_write_fail());
        storage.create_dir_all(Path::new("/spool")).await.unwrap();

        let path = Path::new("/spool/1.bin");
        assert!(storage.write_file(path, b"a").await.is_err());
        storage.write_file(path, b"a").await.unwrap();
        assert_eq!(storage.file_count(), 1);
    }

    #[tokio::test]
    async fn test_write_requires_directory() {
        let storage = SimulatedStorage::new(1);
        assert!(storage
            .write_file(Path::new("/missing/1.bin"), b"a")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_directory() {
        let storage = SimulatedStorage::new(1);
        storage.create_dir_all(Path::new("/root/shard/tmp")).await.unwrap();
        storage
            .write_file(Path::new("/root/shard/1.bin"), b"a")
            .await
            .unwrap();
        storage
            .write_file(Path::new("/root/shard/tmp/2.bin"), b"b")
            .await
            .unwrap();

        let files = storage
            .list_files(Path::new("/root/shard"), "bin")
            .await
            .unwrap();
        assert_eq!(files, vec![PathBuf::from("/root/shard/1.bin")]);

        let dirs = storage.list_dirs(Path::new("/root")).await.unwrap();
        assert_eq!(dirs, vec![PathBuf::from("/root/shard")]);
    }

    #[tokio::test]
    async fn test_forced_read_corruption() {
        let storage = SimulatedStorage::new(1);
        storage.create_dir_all(Path::new("/s")).await.unwrap();
        let path = Path::new("/s/1.bin");
        storage.write_file(path, &[0x00, 0x01]).await.unwrap();

        storage.fault_config().force_read_corruption = true;
        assert_eq!(
            storage.read_file(path).await.unwrap(),
            Bytes::from_static(&[0x00, 0xFE])
        );
        assert_eq!(
            storage.read_file(path).await.unwrap(),
            Bytes::from_static(&[0x00, 0x01])
        );
    }
}
