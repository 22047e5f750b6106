//! Migration controller
//!
//! Watch notifications are turned into `namespace/name` keys on a shared
//! [`WorkQueue`]; a fixed pool of workers pulls keys and runs
//! [`sync_handler`] for each:
//!
//! 1. fetch the Migration from the store (gone means nothing to do)
//! 2. [`reconcile`] or [`reconcile_delete`] against the release backend
//! 3. [`project`] workload state into the status and persist it
//!
//! Only a failed status write makes a key come back with backoff. Backend
//! failures are reported as events and wait for the next change.

mod correlator;
#[cfg(test)]
mod fixtures;
mod reconcile;
mod status;

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::events::EventType;
use kube::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crd::MigrationAction;
use crate::events::{actions, reasons, EventPublisher};
use crate::keys::split_key;
use crate::observer::{wait_for_cache_sync, Synced};
use crate::queue::WorkQueue;
use crate::release::ReleaseBackend;
use crate::store::MigrationStore;
use crate::workload::WorkloadProvider;
use crate::Error;

pub use correlator::{handle_migration, handle_workload, owning_migration};
pub use reconcile::{reconcile, reconcile_delete, RevisionUpdates};
pub use status::{condition_reasons, project};

/// Collaborators shared by every worker
pub struct Context {
    /// Cached Migrations and status writes
    pub store: Arc<dyn MigrationStore>,
    /// Release backend
    pub releases: Arc<dyn ReleaseBackend>,
    /// Workload observations
    pub workloads: Arc<dyn WorkloadProvider>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Create a context from its collaborators
    pub fn new(
        store: Arc<dyn MigrationStore>,
        releases: Arc<dyn ReleaseBackend>,
        workloads: Arc<dyn WorkloadProvider>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            releases,
            workloads,
            events,
        }
    }
}

/// Worker pool settings
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// How long to wait for the watch caches before giving up
    pub cache_sync_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            cache_sync_timeout: Duration::from_secs(60),
        }
    }
}

/// Runs the worker pool over a shared queue
pub struct Controller {
    ctx: Arc<Context>,
    queue: Arc<WorkQueue<String>>,
    config: ControllerConfig,
}

impl Controller {
    /// Create a controller; the queue is shared with the watch handlers
    pub fn new(ctx: Arc<Context>, queue: Arc<WorkQueue<String>>, config: ControllerConfig) -> Self {
        Self { ctx, queue, config }
    }

    /// Wait for `caches`, then process keys until `shutdown` fires
    ///
    /// On shutdown the queue stops handing out keys; each worker finishes
    /// the key it holds and exits. Fails if the caches do not sync in time.
    pub async fn run(self, caches: &[&dyn Synced], shutdown: CancellationToken) -> Result<(), Error> {
        info!("Waiting for informer caches to sync");
        wait_for_cache_sync(self.config.cache_sync_timeout, caches).await?;

        let workers = self.config.workers.max(1);
        info!(workers, "Starting workers");
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let ctx = Arc::clone(&self.ctx);
                let queue = Arc::clone(&self.queue);
                tokio::spawn(async move {
                    while process_next_work_item(&ctx, &queue).await {}
                    debug!(worker = id, "Worker stopped");
                })
            })
            .collect();

        shutdown.cancelled().await;
        info!("Shutting down workers");
        self.queue.shut_down();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("All workers stopped");
        Ok(())
    }
}

/// Take one key off the queue and sync it
///
/// Returns false once the queue has shut down.
pub async fn process_next_work_item(ctx: &Context, queue: &Arc<WorkQueue<String>>) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    match sync_handler(ctx, &key).await {
        Ok(()) => {
            queue.forget(&key);
            debug!(migration = %key, "Successfully synced");
        }
        Err(e) if e.is_retryable() => {
            warn!(
                migration = %key,
                requeues = queue.num_requeues(&key),
                error = %e,
                "Sync failed, requeuing with backoff"
            );
            queue.add_rate_limited(key.clone());
        }
        Err(e) => {
            error!(migration = %key, error = %e, "Sync failed permanently, dropping");
            queue.forget(&key);
        }
    }

    queue.done(&key);
    true
}

/// Sync one Migration identified by `namespace/name`
///
/// Malformed keys, vanished objects, objects being deleted and invalid specs
/// are logged and absorbed. Only a failed status write is returned.
pub async fn sync_handler(ctx: &Context, key: &str) -> Result<(), Error> {
    let (namespace, name) = match split_key(key) {
        Ok(parts) => parts,
        Err(e) => {
            error!(key = %key, error = %e, "Dropping malformed key");
            return Ok(());
        }
    };

    let Some(migration) = ctx.store.get(&namespace, &name) else {
        info!(migration = %key, "Migration no longer exists");
        return Ok(());
    };

    if migration.is_being_deleted() {
        debug!(migration = %key, "Migration is being deleted, skipping");
        return Ok(());
    }

    let obj_ref = migration.object_ref(&());
    if let Err(e) = migration.spec.validate() {
        warn!(migration = %key, error = %e, "Invalid migration spec");
        ctx.events
            .publish(
                &obj_ref,
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
        return Ok(());
    }

    info!(migration = %key, action = %migration.spec.action, "Syncing migration");
    let revisions = match migration.spec.action {
        MigrationAction::Install | MigrationAction::Update => reconcile(ctx, &migration).await,
        MigrationAction::Delete => {
            reconcile_delete(ctx, &migration).await;
            RevisionUpdates::new()
        }
    };

    project(ctx, &migration, revisions).await?;

    ctx.events
        .publish(
            &obj_ref,
            EventType::Normal,
            reasons::SYNCED,
            actions::RECONCILE,
            Some("Migration synced successfully".to_string()),
        )
        .await;
    Ok(())
}
