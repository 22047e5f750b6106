//! Kubernetes Event recording for the Migration controller.
//!
//! Every release transition (install, update, delete, already converged) is
//! published as an Event on the owning Migration, so `kubectl describe`
//! gives an audit trail without reading operator logs.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "ReleaseInstalled")
    /// * `action` - What action was taken (e.g. "Install")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests and dry runs.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// Migration was processed end to end
    pub const SYNCED: &str = "Synced";
    /// Spec failed validation (e.g. empty app name)
    pub const VALIDATION_FAILED: &str = "ValidationFailed";

    /// Release install succeeded
    pub const RELEASE_INSTALLED: &str = "ReleaseInstalled";
    /// Release install failed
    pub const INSTALL_FAILED: &str = "InstallFailed";
    /// Release update succeeded
    pub const RELEASE_UPDATED: &str = "ReleaseUpdated";
    /// Release update failed
    pub const UPDATE_FAILED: &str = "UpdateFailed";
    /// Release removed from the backend
    pub const RELEASE_DELETED: &str = "ReleaseDeleted";
    /// Release removal failed
    pub const DELETE_FAILED: &str = "DeleteFailed";
    /// Release already at the tracked revision, nothing to do
    pub const RELEASE_CONVERGED: &str = "ReleaseConverged";
    /// Listing running releases failed
    pub const LIST_RELEASES_FAILED: &str = "ListReleasesFailed";
    /// Chart payload is unusable
    pub const INVALID_CHART: &str = "InvalidChart";
    /// Listing workloads for status projection failed
    pub const LIST_WORKLOADS_FAILED: &str = "ListWorkloadsFailed";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Installing a release
    pub const INSTALL: &str = "Install";
    /// Updating a release
    pub const UPDATE: &str = "Update";
    /// Deleting a release
    pub const DELETE: &str = "Delete";
    /// Projecting workload state into status
    pub const PROJECT_STATUS: &str = "ProjectStatus";
}
