//! Release reconciliation for a single Migration
//!
//! Each pass takes at most one corrective action against the release
//! backend and returns. Convergence of several releases therefore spans
//! several passes, each triggered by the workload changes the previous
//! action caused.
//!
//! Backend failures never bubble up from here: they are published as
//! Warning events on the Migration and the pass ends without a revision
//! update for the affected release.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use kube::Resource;
use tracing::{debug, info, instrument, warn};

use super::Context;
use crate::crd::{Migration, ReleaseConfig};
use crate::events::{actions, reasons};
use crate::keys::release_pattern;
use crate::release::Release;

/// Revisions produced by this pass, keyed by release name
pub type RevisionUpdates = BTreeMap<String, i32>;

/// Drive the releases of an Install/Update migration one step closer to the
/// desired state
#[instrument(skip_all, fields(migration = %migration.key()))]
pub async fn reconcile(ctx: &Context, migration: &Migration) -> RevisionUpdates {
    let mut revisions = RevisionUpdates::new();

    if migration.is_finished() {
        debug!("Migration already finished, nothing to do");
        return revisions;
    }

    let obj_ref = migration.object_ref(&());
    let spec = &migration.spec;

    let running = match ctx
        .releases
        .list_releases(&release_pattern(&spec.app_name))
        .await
    {
        Ok(running) => running,
        Err(e) => {
            warn!(error = %e, "Failed to list releases");
            ctx.events
                .publish(
                    &obj_ref,
                    EventType::Warning,
                    reasons::LIST_RELEASES_FAILED,
                    actions::RECONCILE,
                    Some(format!("Listing releases of {} failed: {e}", spec.app_name)),
                )
                .await;
            return revisions;
        }
    };

    // releases no longer listed in the spec go first, one per pass
    if let Some(stale) = running.iter().find(|r| spec.release(&r.name).is_none()) {
        info!(release = %stale.name, "Deleting release that is no longer desired");
        delete_release(ctx, &obj_ref, &stale.name, &stale.namespace).await;
        return revisions;
    }

    for desired in &spec.releases {
        let current = running.iter().find(|r| r.name == desired.name);
        match current {
            Some(current) if migration.tracked_revision(&desired.name) == Some(current.version) => {
                debug!(release = %desired.name, revision = current.version, "Release converged");
                ctx.events
                    .publish(
                        &obj_ref,
                        EventType::Normal,
                        reasons::RELEASE_CONVERGED,
                        actions::RECONCILE,
                        Some(format!(
                            "Release {} already at revision {}",
                            desired.name, current.version
                        )),
                    )
                    .await;
            }
            Some(current) => {
                if let Some(version) = update_release(ctx, &obj_ref, migration, desired, current).await {
                    revisions.insert(desired.name.clone(), version);
                }
                return revisions;
            }
            None => {
                if let Some(version) = install_release(ctx, &obj_ref, migration, desired).await {
                    revisions.insert(desired.name.clone(), version);
                }
                return revisions;
            }
        }
    }

    debug!("All releases converged");
    revisions
}

/// Remove every release listed by a Delete migration
///
/// A release the backend no longer knows counts as deleted.
#[instrument(skip_all, fields(migration = %migration.key()))]
pub async fn reconcile_delete(ctx: &Context, migration: &Migration) {
    if migration.is_finished() {
        debug!("Migration already finished, nothing to delete");
        return;
    }

    let obj_ref = migration.object_ref(&());
    for release in &migration.spec.releases {
        delete_release(ctx, &obj_ref, &release.name, &release.namespace).await;
    }
}

async fn delete_release(ctx: &Context, obj_ref: &ObjectReference, name: &str, namespace: &str) {
    let (type_, reason, note) = match ctx.releases.delete_release(name, namespace, true).await {
        Ok(()) => {
            info!(release = %name, "Release deleted");
            (
                EventType::Normal,
                reasons::RELEASE_DELETED,
                format!("Release {name} has been deleted"),
            )
        }
        Err(e) if e.is_not_found() => {
            debug!(release = %name, "Release already absent");
            (
                EventType::Normal,
                reasons::RELEASE_DELETED,
                format!("Release {name} was already absent"),
            )
        }
        Err(e) => {
            warn!(release = %name, error = %e, "Failed to delete release");
            (
                EventType::Warning,
                reasons::DELETE_FAILED,
                format!("Deleting release {name} failed: {e}"),
            )
        }
    };

    ctx.events
        .publish(obj_ref, type_, reason, actions::DELETE, Some(note))
        .await;
}

/// Returns false (after publishing an event) when the chart cannot be used
async fn chart_is_usable(
    ctx: &Context,
    obj_ref: &ObjectReference,
    migration: &Migration,
    release: &str,
    action: &str,
) -> bool {
    if !migration.spec.chart.is_empty() {
        return true;
    }
    warn!(release = %release, "Migration has no chart payload");
    ctx.events
        .publish(
            obj_ref,
            EventType::Warning,
            reasons::INVALID_CHART,
            action,
            Some(format!("No chart payload to apply to release {release}")),
        )
        .await;
    false
}

async fn install_release(
    ctx: &Context,
    obj_ref: &ObjectReference,
    migration: &Migration,
    desired: &ReleaseConfig,
) -> Option<i32> {
    if !chart_is_usable(ctx, obj_ref, migration, &desired.name, actions::INSTALL).await {
        return None;
    }

    info!(release = %desired.name, namespace = %desired.namespace, "Installing release");
    match ctx
        .releases
        .install_release(
            &migration.spec.chart,
            &desired.namespace,
            &desired.name,
            &desired.raw,
        )
        .await
    {
        Ok(release) => {
            ctx.events
                .publish(
                    obj_ref,
                    EventType::Normal,
                    reasons::RELEASE_INSTALLED,
                    actions::INSTALL,
                    Some(format!(
                        "Installed release {} at revision {}",
                        desired.name, release.version
                    )),
                )
                .await;
            Some(release.version)
        }
        Err(e) => {
            warn!(release = %desired.name, error = %e, "Failed to install release");
            ctx.events
                .publish(
                    obj_ref,
                    EventType::Warning,
                    reasons::INSTALL_FAILED,
                    actions::INSTALL,
                    Some(format!("Installing release {} failed: {e}", desired.name)),
                )
                .await;
            None
        }
    }
}

async fn update_release(
    ctx: &Context,
    obj_ref: &ObjectReference,
    migration: &Migration,
    desired: &ReleaseConfig,
    current: &Release,
) -> Option<i32> {
    if !chart_is_usable(ctx, obj_ref, migration, &desired.name, actions::UPDATE).await {
        return None;
    }

    info!(
        release = %desired.name,
        running = current.version,
        tracked = ?migration.tracked_revision(&desired.name),
        "Updating release"
    );
    match ctx
        .releases
        .update_release(
            &desired.name,
            &desired.namespace,
            &migration.spec.chart,
            &desired.raw,
        )
        .await
    {
        Ok(release) => {
            ctx.events
                .publish(
                    obj_ref,
                    EventType::Normal,
                    reasons::RELEASE_UPDATED,
                    actions::UPDATE,
                    Some(format!(
                        "Updated release {} from revision {} to {}",
                        desired.name, current.version, release.version
                    )),
                )
                .await;
            Some(release.version)
        }
        Err(e) => {
            warn!(release = %desired.name, error = %e, "Failed to update release");
            ctx.events
                .publish(
                    obj_ref,
                    EventType::Warning,
                    reasons::UPDATE_FAILED,
                    actions::UPDATE,
                    Some(format!("Updating release {} failed: {e}", desired.name)),
                )
                .await;
            None
        }
    }
}
