//! Status projection: turn observed workloads into Migration conditions
//!
//! One condition per desired release, typed `Available-<release>`. A
//! release only counts as available when its workload has every replica up
//! *and* the backend reports the revision the controller last drove it to,
//! so a rollout still serving the previous revision is not mistaken for a
//! finished one.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::reconcile::RevisionUpdates;
use super::Context;
use crate::crd::{
    upsert_condition, Condition, ConditionStatus, Migration, MigrationAction, MigrationSpec,
    MigrationStatus,
};
use crate::events::{actions, reasons};
use crate::keys::{app_selector, condition_type};
use crate::workload::WorkloadObservation;
use crate::Error;

/// Condition reasons written by the projector
pub mod condition_reasons {
    /// Workload fully available at the tracked revision
    pub const AVAILABLE: &str = "Available";
    /// Replica counts do not line up yet
    pub const WAITING: &str = "WaitingForAvailability";
    /// Workload is up but the backend revision differs from the tracked one
    pub const REVISION_MISMATCH: &str = "RevisionMismatch";
    /// Backend could not confirm the revision
    pub const REVISION_UNKNOWN: &str = "RevisionUnknown";
    /// Release removed and its workload is gone
    pub const DELETED: &str = "Deleted";
    /// Release removed but its workload still exists
    pub const WORKLOAD_EXISTS: &str = "WorkloadStillExists";
}

/// Recompute the status of `migration` and persist it
///
/// Works on an owned copy checked out from the store. A failed workload
/// listing is reported as an event and skips the write; only a failed
/// status write is returned.
#[instrument(skip_all, fields(migration = %migration.key()))]
pub async fn project(
    ctx: &Context,
    migration: &Migration,
    revision_updates: RevisionUpdates,
) -> Result<(), Error> {
    let namespace = migration.namespace().unwrap_or_default();
    let Some(mut copy) = ctx.store.checkout(&namespace, &migration.name_any()) else {
        debug!("Migration disappeared before status projection");
        return Ok(());
    };
    let obj_ref = copy.object_ref(&());

    let workloads = match ctx
        .workloads
        .list_workloads(&namespace, &app_selector(&copy.spec.app_name))
        .await
    {
        Ok(workloads) => workloads,
        Err(e) => {
            warn!(error = %e, "Failed to list workloads, skipping status update");
            ctx.events
                .publish(
                    &obj_ref,
                    EventType::Warning,
                    reasons::LIST_WORKLOADS_FAILED,
                    actions::PROJECT_STATUS,
                    Some(format!("Listing workloads failed: {e}")),
                )
                .await;
            return Ok(());
        }
    };

    let now = Utc::now();
    let mut status = copy.status.take().unwrap_or_default();
    let initial_finished = status.finished;

    match copy.spec.action {
        MigrationAction::Delete => project_deleted(&copy.spec, &workloads, &mut status, now),
        MigrationAction::Install | MigrationAction::Update => {
            project_available(ctx, &copy.spec, &workloads, &mut status, now).await
        }
    }

    prune_conditions(&copy.spec, &workloads, &mut status);
    status.release_revision.extend(revision_updates);

    let finished = compute_finished(&copy.spec, &status, workloads.len());
    status.finished = finished.into();
    if !initial_finished.is_true() || !finished {
        status.last_update_time = Some(now);
    }

    if finished && !initial_finished.is_true() {
        info!("Migration finished");
    }
    debug!(
        finished,
        conditions = status.conditions.len(),
        workloads = workloads.len(),
        "Writing status"
    );

    copy.status = Some(status);
    ctx.store.update_status(&copy).await?;
    Ok(())
}

async fn project_available(
    ctx: &Context,
    spec: &MigrationSpec,
    workloads: &[WorkloadObservation],
    status: &mut MigrationStatus,
    now: DateTime<Utc>,
) {
    // tracked revisions as they were before this pass
    let tracked: BTreeMap<String, i32> = status.release_revision.clone();

    for workload in workloads {
        let Some(release) = workload.release.as_deref().and_then(|r| spec.release(r)) else {
            debug!(workload = %workload.name, "Workload belongs to no desired release, skipping");
            continue;
        };

        let counts = format!(
            "Workload {}: desired {}, available {}, expected {}",
            workload.name, workload.desired_replicas, workload.available_replicas, release.replicas
        );

        let (state, reason, message) = if !workload.is_available(release.replicas) {
            (false, condition_reasons::WAITING, format!("{counts}; waiting for availability"))
        } else {
            let expected = tracked.get(&release.name).copied();
            match ctx.releases.get_release(&release.name, &release.namespace).await {
                Ok(Some(current)) if Some(current.version) == expected => {
                    (true, condition_reasons::AVAILABLE, counts)
                }
                Ok(Some(current)) => (
                    false,
                    condition_reasons::REVISION_MISMATCH,
                    format!(
                        "{counts}; release revision {} does not match tracked revision {}",
                        current.version,
                        expected.map_or_else(|| "none".to_string(), |v| v.to_string())
                    ),
                ),
                Ok(None) => (
                    false,
                    condition_reasons::REVISION_UNKNOWN,
                    format!("{counts}; release {} not found", release.name),
                ),
                Err(e) => {
                    warn!(release = %release.name, error = %e, "Failed to read release revision");
                    (
                        false,
                        condition_reasons::REVISION_UNKNOWN,
                        format!("{counts}; could not read release revision: {e}"),
                    )
                }
            }
        };

        upsert_condition(
            &mut status.conditions,
            Condition::new(
                condition_type(&release.name),
                state.into(),
                reason,
                message,
                now,
            ),
        );
    }
}

fn project_deleted(
    spec: &MigrationSpec,
    workloads: &[WorkloadObservation],
    status: &mut MigrationStatus,
    now: DateTime<Utc>,
) {
    for release in &spec.releases {
        let leftover = workloads
            .iter()
            .find(|w| w.release.as_deref() == Some(release.name.as_str()));

        let condition = match leftover {
            Some(workload) => Condition::new(
                condition_type(&release.name),
                ConditionStatus::False,
                condition_reasons::WORKLOAD_EXISTS,
                format!("Workload {} still exists", workload.name),
                now,
            ),
            None => Condition::new(
                condition_type(&release.name),
                ConditionStatus::True,
                condition_reasons::DELETED,
                format!("Release {} has been deleted", release.name),
                now,
            ),
        };
        upsert_condition(&mut status.conditions, condition);
    }
}

/// Drop conditions of releases that are no longer desired once no workload
/// of theirs is observed
fn prune_conditions(
    spec: &MigrationSpec,
    workloads: &[WorkloadObservation],
    status: &mut MigrationStatus,
) {
    let keep: BTreeSet<String> = spec
        .releases
        .iter()
        .map(|r| condition_type(&r.name))
        .chain(
            workloads
                .iter()
                .filter_map(|w| w.release.as_deref())
                .map(condition_type),
        )
        .collect();

    status.conditions.retain(|c| {
        let kept = keep.contains(&c.type_);
        if !kept {
            debug!(condition = %c.type_, "Release no longer desired, dropping its condition");
        }
        kept
    });
}

/// Every release reported, every condition true, and (for Install/Update)
/// exactly one workload per release
fn compute_finished(spec: &MigrationSpec, status: &MigrationStatus, workload_count: usize) -> bool {
    if status.conditions.len() != spec.releases.len() {
        return false;
    }
    if status.conditions.iter().any(|c| !c.status.is_true()) {
        return false;
    }
    if spec.action != MigrationAction::Delete && workload_count != spec.releases.len() {
        return false;
    }
    true
}
