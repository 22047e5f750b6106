//! Map watch notifications to work-queue keys
//!
//! Migration changes enqueue the Migration itself. Workload changes are
//! traced back to their owning Migration through the `app` label: the
//! Migration with that name in the workload's namespace.
//!
//! The controller's own status writes are already in the cache when their
//! watch events arrive, so those events produce no notification here.

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tracing::{debug, trace};

use crate::crd::Migration;
use crate::keys::APP_LABEL;
use crate::observer::Notification;
use crate::queue::WorkQueue;
use crate::store::MigrationStore;

/// Enqueue a Migration on add or update; deletions need no work
pub fn handle_migration(queue: &WorkQueue<String>, notification: Notification<Migration>) {
    match notification {
        Notification::Added(migration) => {
            trace!(migration = %migration.key(), "Migration added");
            queue.add(migration.key());
        }
        Notification::Updated { new, .. } => {
            trace!(migration = %new.key(), "Migration updated");
            queue.add(new.key());
        }
        Notification::Deleted(_) | Notification::DeletedUnknown { .. } => {}
    }
}

/// Enqueue the Migration owning a changed workload, if there is one
pub fn handle_workload(
    store: &dyn MigrationStore,
    queue: &WorkQueue<String>,
    notification: Notification<Deployment>,
) {
    if let Notification::Updated { old, new } = &notification {
        if old.resource_version().is_some() && old.resource_version() == new.resource_version() {
            trace!(workload = %new.name_any(), "Resync without change, ignoring");
            return;
        }
    }

    if let Notification::DeletedUnknown { key, .. } = &notification {
        debug!(workload = %key, "Recovered workload deleted while the watch was down");
    }

    if let Some(key) = owning_migration(store, notification.object()) {
        queue.add(key);
    }
}

/// Key of the live Migration that owns `workload`
pub fn owning_migration(store: &dyn MigrationStore, workload: &Deployment) -> Option<String> {
    let app = workload.labels().get(APP_LABEL)?;
    let namespace = workload.namespace().unwrap_or_default();

    let Some(migration) = store.get(&namespace, app) else {
        debug!(workload = %workload.name_any(), app = %app, "No migration for workload, ignoring");
        return None;
    };
    if migration.is_being_deleted() {
        debug!(workload = %workload.name_any(), app = %app, "Owning migration is being deleted, ignoring");
        return None;
    }
    Some(migration.key())
}
