//! Workload status provider
//!
//! The projector only needs replica counts and the release a workload came
//! from, so Deployments are flattened into [`WorkloadObservation`] snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;

#[cfg(test)]
use mockall::automock;

use crate::keys::RELEASE_LABEL;
use crate::observer::ObjectCache;
use crate::Error;

/// Read-only view of one workload's rollout state
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadObservation {
    /// Workload name
    pub name: String,
    /// Workload namespace
    pub namespace: String,
    /// Labels on the workload object
    pub labels: BTreeMap<String, String>,
    /// Release that produced the workload, from the pod template labels
    pub release: Option<String>,
    /// Replicas the workload currently targets
    pub desired_replicas: i32,
    /// Replicas that are available
    pub available_replicas: i32,
}

impl WorkloadObservation {
    /// Returns true when desired, available and `expected` all agree
    pub fn is_available(&self, expected: i32) -> bool {
        self.desired_replicas == self.available_replicas && self.available_replicas == expected
    }
}

impl From<&Deployment> for WorkloadObservation {
    fn from(deployment: &Deployment) -> Self {
        let status = deployment.status.as_ref();
        let release = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.as_ref())
            .and_then(|labels| labels.get(RELEASE_LABEL))
            .cloned();

        Self {
            name: deployment.metadata.name.clone().unwrap_or_default(),
            namespace: deployment.metadata.namespace.clone().unwrap_or_default(),
            labels: deployment.metadata.labels.clone().unwrap_or_default(),
            release,
            desired_replicas: status.and_then(|s| s.replicas).unwrap_or(0),
            available_replicas: status.and_then(|s| s.available_replicas).unwrap_or(0),
        }
    }
}

/// Source of workload observations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadProvider: Send + Sync {
    /// List workloads in `namespace` whose labels contain every entry of
    /// `selector`
    async fn list_workloads(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<WorkloadObservation>, Error>;
}

/// Provider reading Deployments from the watch cache
pub struct CachedWorkloadProvider {
    cache: Arc<ObjectCache<Deployment>>,
}

impl CachedWorkloadProvider {
    /// Create a provider over the Deployment cache
    pub fn new(cache: Arc<ObjectCache<Deployment>>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl WorkloadProvider for CachedWorkloadProvider {
    async fn list_workloads(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<WorkloadObservation>, Error> {
        let mut workloads: Vec<WorkloadObservation> = self
            .cache
            .list_namespace(namespace)
            .iter()
            .filter(|d| matches_selector(d.metadata.labels.as_ref(), selector))
            .map(|d| WorkloadObservation::from(d.as_ref()))
            .collect();
        workloads.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workloads)
    }
}

fn matches_selector(
    labels: Option<&BTreeMap<String, String>>,
    selector: &BTreeMap<String, String>,
) -> bool {
    selector.iter().all(|(key, value)| {
        labels
            .and_then(|labels| labels.get(key))
            .is_some_and(|v| v == value)
    })
}
