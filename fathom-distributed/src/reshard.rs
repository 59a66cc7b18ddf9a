//! Resharding coordinator client.
//!
//! Drives one cluster-wide resharding job from the distributed table:
//!
//! 1. Create a coordinator record in the registry.
//! 2. Register the `ALTER TABLE ... RESHARD ... COORDINATE WITH` query.
//! 3. Broadcast it to every shard and drain the completion stream.
//! 4. Delete the record.
//!
//! Participants wait for each other on registry barriers. If one shard
//! fails, the others would wait forever, so the first shard error marks
//! the record [`CoordinatorStatus::Error`] before anything else happens,
//! which releases every barrier.
//!
//! On failure, including a panic while the job runs, the record is marked
//! (unless already marked), its state is dumped and logged, and it is
//! deleted. Cleanup errors are logged; the
//! caller always sees the error that failed the job.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fathom_core::{AlterCommand, AlterQuery, Query, ReshardCommand, TableRef};
use fathom_routing::Cluster;
use futures::FutureExt;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::{DistError, DistResult};
use crate::fanout::{AlterQueryConstructor, FanOutExecutor};
use crate::registry::{CoordinatorRegistry, CoordinatorStatus, ReshardingService};
use crate::union::ErrorCallback;

/// Runs resharding jobs for one distributed table.
pub struct ReshardingCoordinatorClient {
    service: Option<Arc<dyn ReshardingService>>,
    executor: Arc<FanOutExecutor>,
    cluster: Arc<Cluster>,
    remote: TableRef,
}

impl std::fmt::Debug for ReshardingCoordinatorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReshardingCoordinatorClient")
            .field("cluster", &self.cluster.name())
            .field("remote", &self.remote)
            .field("has_service", &self.service.is_some())
            .finish_non_exhaustive()
    }
}

impl ReshardingCoordinatorClient {
    /// Creates a client.
    #[must_use]
    pub fn new(
        service: Option<Arc<dyn ReshardingService>>,
        executor: Arc<FanOutExecutor>,
        cluster: Arc<Cluster>,
        remote: TableRef,
    ) -> Self {
        Self {
            service,
            executor,
            cluster,
            remote,
        }
    }

    /// Reshards partitions of the remote table across the cluster.
    ///
    /// # Errors
    /// Returns `ServiceUnavailable` if no resharding worker is running,
    /// `InvalidArgument` if the request names a coordinator, and otherwise
    /// the first error that failed the job.
    pub async fn reshard(&self, request: &ReshardCommand, settings: &Settings) -> DistResult<()> {
        let service = match &self.service {
            Some(service) if service.is_started() => service,
            _ => {
                return Err(DistError::ServiceUnavailable {
                    service: "resharding worker",
                })
            }
        };
        if request.coordinator.is_some() {
            return Err(DistError::InvalidArgument {
                name: "coordinator",
                reason: "COORDINATE WITH is not allowed on distributed tables".to_string(),
            });
        }

        let registry = service.registry();
        let coordinator_id = registry
            .create_coordinator(&self.cluster.descriptor())
            .await?;
        let error_marked = Arc::new(AtomicBool::new(false));

        // A panic must not leave the record behind with participants waiting on it.
        let run = self.run(&registry, &coordinator_id, request, settings, &error_marked);
        let result = AssertUnwindSafe(run)
            .catch_unwind()
            .await
            .unwrap_or(Err(DistError::Panicked {
                operation: "resharding",
            }));

        match result {
            Ok(()) => {
                registry.delete_coordinator(&coordinator_id).await?;
                info!(coordinator = %coordinator_id, remote = %self.remote, "resharding finished");
                Ok(())
            }
            Err(e) => {
                self.clean_up_failed(registry.as_ref(), &coordinator_id, &e, &error_marked)
                    .await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        registry: &Arc<dyn CoordinatorRegistry>,
        coordinator_id: &str,
        request: &ReshardCommand,
        settings: &Settings,
        error_marked: &Arc<AtomicBool>,
    ) -> DistResult<()> {
        let mut command = request.clone();
        command.coordinator = Some(coordinator_id.to_string());
        let alter = AlterQuery {
            target: self.remote.clone(),
            commands: vec![AlterCommand::ReshardPartition(command)],
        };
        registry
            .register_query(coordinator_id, &alter.to_string())
            .await?;

        let callback = mark_error_callback(
            Arc::clone(registry),
            coordinator_id.to_string(),
            Arc::clone(error_marked),
        );
        let mut merged = self.executor.execute(
            &Query::Alter(alter),
            &AlterQueryConstructor,
            settings,
            &[],
            false,
            Some(callback),
        );

        while let Some(item) = merged.next().await {
            item?;
        }
        Ok(())
    }

    async fn clean_up_failed(
        &self,
        registry: &dyn CoordinatorRegistry,
        coordinator_id: &str,
        cause: &DistError,
        error_marked: &AtomicBool,
    ) {
        if !error_marked.load(Ordering::SeqCst) {
            if let Err(e) = registry
                .set_status(coordinator_id, CoordinatorStatus::Error, &cause.to_string())
                .await
            {
                warn!(coordinator = %coordinator_id, error = %e, "failed to mark coordinator");
            }
        }

        let state = match registry.dump_state(coordinator_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(coordinator = %coordinator_id, error = %e, "failed to dump coordinator state");
                String::new()
            }
        };
        error!(
            coordinator = %coordinator_id,
            remote = %self.remote,
            cause = %cause,
            state = %state,
            "resharding failed"
        );

        if let Err(e) = registry.delete_coordinator(coordinator_id).await {
            warn!(coordinator = %coordinator_id, error = %e, "failed to delete coordinator");
        }
    }
}

/// Marks the coordinator failed on the first shard error so that no
/// participant is left waiting on a barrier.
fn mark_error_callback(
    registry: Arc<dyn CoordinatorRegistry>,
    coordinator_id: String,
    error_marked: Arc<AtomicBool>,
) -> ErrorCallback {
    Arc::new(move |cause: &DistError| {
        let registry = Arc::clone(&registry);
        let coordinator_id = coordinator_id.clone();
        let error_marked = Arc::clone(&error_marked);
        let message = cause.to_string();
        async move {
            if error_marked
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            if let Err(e) = registry
                .set_status(&coordinator_id, CoordinatorStatus::Error, &message)
                .await
            {
                // Leave the flag clear so cleanup tries again.
                error_marked.store(false, Ordering::SeqCst);
                warn!(coordinator = %coordinator_id, error = %e, "failed to mark coordinator");
            }
        }
        .boxed()
    })
}
