//! Resharding coordinator registry.
//!
//! Resharding runs as a distributed job. A coordinator record in the
//! registry tracks the job: which cluster it spans, the query each
//! participant runs, and whether any participant failed. Participants
//! block on barriers in the registry until every other participant
//! arrives or the coordinator is marked [`CoordinatorStatus::Error`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{DistError, DistResult};

/// Status of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorStatus {
    /// The job is in progress.
    Running,
    /// A participant failed. Barriers release with an error.
    Error,
}

impl fmt::Display for CoordinatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Client of the coordination registry.
#[async_trait]
pub trait CoordinatorRegistry: Send + Sync + 'static {
    /// Creates a coordinator for a cluster and returns its identifier.
    async fn create_coordinator(&self, cluster_descriptor: &str) -> DistResult<String>;

    /// Records the query participants will run.
    async fn register_query(&self, coordinator_id: &str, query: &str) -> DistResult<()>;

    /// Sets the coordinator status.
    async fn set_status(
        &self,
        coordinator_id: &str,
        status: CoordinatorStatus,
        message: &str,
    ) -> DistResult<()>;

    /// Returns a human readable snapshot of the coordinator.
    async fn dump_state(&self, coordinator_id: &str) -> DistResult<String>;

    /// Deletes the coordinator.
    async fn delete_coordinator(&self, coordinator_id: &str) -> DistResult<()>;
}

/// Background resharding service.
pub trait ReshardingService: Send + Sync + 'static {
    /// Whether the worker is running.
    fn is_started(&self) -> bool;

    /// Registry client used to coordinate jobs.
    fn registry(&self) -> Arc<dyn CoordinatorRegistry>;
}

// -----------------------------------------------------------------------------
// In-memory registry
// -----------------------------------------------------------------------------

/// One coordinator as stored by [`InMemoryRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorRecord {
    /// Identifier.
    pub id: String,
    /// Cluster descriptor passed at creation.
    pub cluster: String,
    /// Current status.
    pub status: CoordinatorStatus,
    /// Message attached to the last status change.
    pub message: String,
    /// Registered participant queries.
    pub queries: Vec<String>,
}

/// Fault injection for [`InMemoryRegistry`]. Every flag fails the next
/// matching call once.
#[derive(Debug, Clone, Default)]
pub struct RegistryFaultConfig {
    /// Fail the next `create_coordinator`.
    pub force_create_fail: bool,
    /// Fail the next `register_query`.
    pub force_register_fail: bool,
    /// Fail the next `set_status`.
    pub force_status_fail: bool,
    /// Fail the next `dump_state`.
    pub force_dump_fail: bool,
    /// Fail the next `delete_coordinator`.
    pub force_delete_fail: bool,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    records: HashMap<String, CoordinatorRecord>,
    status_updates: Vec<(String, CoordinatorStatus)>,
    delete_calls: HashMap<String, u32>,
    faults: RegistryFaultConfig,
}

/// Registry held in memory.
///
/// Keeps deleted records' call counts so tests can check that cleanup
/// ran exactly once.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    state: Arc<Mutex<State>>,
}

impl InMemoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("registry lock poisoned")
    }

    /// Replaces the fault configuration.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    pub fn set_faults(&self, faults: RegistryFaultConfig) {
        self.lock().faults = faults;
    }

    /// Returns a live coordinator.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn record(&self, id: &str) -> Option<CoordinatorRecord> {
        self.lock().records.get(id).cloned()
    }

    /// Number of live coordinators.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether no coordinator is live.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every status change, in order.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn status_updates(&self) -> Vec<(String, CoordinatorStatus)> {
        self.lock().status_updates.clone()
    }

    /// Number of delete calls made for an identifier, successful or not.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn delete_calls(&self, id: &str) -> u32 {
        self.lock().delete_calls.get(id).copied().unwrap_or(0)
    }

    /// Identifiers ever issued, in creation order.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn issued_ids(&self) -> Vec<String> {
        (1..=self.lock().next_id).map(coordinator_id).collect()
    }
}

fn coordinator_id(n: u64) -> String {
    format!("coordinator-{n:04}")
}

fn not_found(operation: &'static str, id: &str) -> DistError {
    DistError::registry(operation, format!("no coordinator {id}"))
}

#[async_trait]
impl CoordinatorRegistry for InMemoryRegistry {
    async fn create_coordinator(&self, cluster_descriptor: &str) -> DistResult<String> {
        let mut state = self.lock();
        if std::mem::take(&mut state.faults.force_create_fail) {
            return Err(DistError::registry("create", "simulated failure"));
        }
        state.next_id += 1;
        let id = coordinator_id(state.next_id);
        state.records.insert(
            id.clone(),
            CoordinatorRecord {
                id: id.clone(),
                cluster: cluster_descriptor.to_string(),
                status: CoordinatorStatus::Running,
                message: String::new(),
                queries: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn register_query(&self, coordinator_id: &str, query: &str) -> DistResult<()> {
        let mut state = self.lock();
        if std::mem::take(&mut state.faults.force_register_fail) {
            return Err(DistError::registry("register_query", "simulated failure"));
        }
        let record = state
            .records
            .get_mut(coordinator_id)
            .ok_or_else(|| not_found("register_query", coordinator_id))?;
        record.queries.push(query.to_string());
        Ok(())
    }

    async fn set_status(
        &self,
        coordinator_id: &str,
        status: CoordinatorStatus,
        message: &str,
    ) -> DistResult<()> {
        let mut state = self.lock();
        if std::mem::take(&mut state.faults.force_status_fail) {
            return Err(DistError::registry("set_status", "simulated failure"));
        }
        let record = state
            .records
            .get_mut(coordinator_id)
            .ok_or_else(|| not_found("set_status", coordinator_id))?;
        record.status = status;
        record.message = message.to_string();
        state
            .status_updates
            .push((coordinator_id.to_string(), status));
        Ok(())
    }

    async fn dump_state(&self, coordinator_id: &str) -> DistResult<String> {
        let mut state = self.lock();
        if std::mem::take(&mut state.faults.force_dump_fail) {
            return Err(DistError::registry("dump_state", "simulated failure"));
        }
        let record = state
            .records
            .get(coordinator_id)
            .ok_or_else(|| not_found("dump_state", coordinator_id))?;
        Ok(format!(
            "coordinator {} on {}: status={} message={:?} queries={}",
            record.id,
            record.cluster,
            record.status,
            record.message,
            record.queries.len()
        ))
    }

    async fn delete_coordinator(&self, coordinator_id: &str) -> DistResult<()> {
        let mut state = self.lock();
        *state
            .delete_calls
            .entry(coordinator_id.to_string())
            .or_insert(0) += 1;
        if std::mem::take(&mut state.faults.force_delete_fail) {
            return Err(DistError::registry("delete", "simulated failure"));
        }
        state
            .records
            .remove(coordinator_id)
            .map(|_| ())
            .ok_or_else(|| not_found("delete", coordinator_id))
    }
}

/// Resharding service backed by an [`InMemoryRegistry`].
#[derive(Debug, Default)]
pub struct InMemoryReshardingService {
    started: AtomicBool,
    registry: InMemoryRegistry,
    handles: AtomicU64,
}

impl InMemoryReshardingService {
    /// Creates a service in the given state.
    #[must_use]
    pub fn new(registry: InMemoryRegistry, started: bool) -> Self {
        Self {
            started: AtomicBool::new(started),
            registry,
            handles: AtomicU64::new(0),
        }
    }

    /// Starts or stops the worker.
    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }

    /// Number of times the registry was handed out.
    #[must_use]
    pub fn registry_handles(&self) -> u64 {
        self.handles.load(Ordering::Relaxed)
    }
}

impl ReshardingService for InMemoryReshardingService {
    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn registry(&self) -> Arc<dyn CoordinatorRegistry> {
        self.handles.fetch_add(1, Ordering::Relaxed);
        Arc::new(self.registry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_coordinator_lifecycle() {
        let registry = InMemoryRegistry::new();
        let id = registry.create_coordinator("c:1*[a:1]").await.unwrap();
        registry.register_query(&id, "ALTER TABLE ...").await.unwrap();
        registry
            .set_status(&id, CoordinatorStatus::Error, "boom")
            .await
            .unwrap();

        let record = registry.record(&id).unwrap();
        assert_eq!(record.status, CoordinatorStatus::Error);
        assert_eq!(record.queries.len(), 1);
        assert!(registry.dump_state(&id).await.unwrap().contains("status=error"));

        registry.delete_coordinator(&id).await.unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.delete_calls(&id), 1);
        assert!(registry.delete_coordinator(&id).await.is_err());
        assert_eq!(registry.delete_calls(&id), 2);
    }

    #[tokio::test]
    async fn test_forced_failures_fire_once() {
        let registry = InMemoryRegistry::new();
        registry.set_faults(RegistryFaultConfig {
            force_create_fail: true,
            ..RegistryFaultConfig::default()
        });
        assert!(registry.create_coordinator("c").await.is_err());
        let id = registry.create_coordinator("c").await.unwrap();
        assert_eq!(registry.issued_ids(), vec![id]);
    }

    #[test]
    fn test_service_state() {
        let service = InMemoryReshardingService::new(InMemoryRegistry::new(), false);
        assert!(!service.is_started());
        service.set_started(true);
        assert!(service.is_started());
    }
}
