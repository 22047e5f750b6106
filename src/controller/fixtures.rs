//! In-memory collaborators for controller tests
//!
//! The fakes keep just enough state to drive a migration end to end:
//! releases get a revision that bumps on upgrade, workloads are set by the
//! test, and the store persists status writes so the next pass sees them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use parking_lot::Mutex;

use super::Context;
use crate::crd::{Migration, MigrationAction, MigrationSpec, ReleaseConfig};
use crate::events::EventPublisher;
use crate::keys::{object_key, APP_LABEL, RELEASE_LABEL};
use crate::release::{Release, ReleaseBackend};
use crate::store::MigrationStore;
use crate::workload::{WorkloadObservation, WorkloadProvider};
use crate::Error;

/// `ns/demo` with `demo-blue` and `demo-green`, two replicas each
pub fn demo_migration(action: MigrationAction) -> Migration {
    let release = |name: &str| ReleaseConfig {
        name: name.to_string(),
        namespace: "ns".to_string(),
        raw: "replicaCount: 2".to_string(),
        replicas: 2,
    };
    Migration {
        metadata: ObjectMeta {
            name: Some("demo".to_string()),
            namespace: Some("ns".to_string()),
            uid: Some("demo-uid".to_string()),
            ..Default::default()
        },
        spec: MigrationSpec {
            app_name: "demo".to_string(),
            action,
            chart: b"chart-archive".to_vec(),
            releases: vec![release("demo-blue"), release("demo-green")],
        },
        status: None,
    }
}

/// Workload of `demo` produced by `release`
pub fn workload(release: &str, desired: i32, available: i32) -> WorkloadObservation {
    WorkloadObservation {
        name: release.to_string(),
        namespace: "ns".to_string(),
        labels: BTreeMap::from([
            (APP_LABEL.to_string(), "demo".to_string()),
            (RELEASE_LABEL.to_string(), release.to_string()),
        ]),
        release: Some(release.to_string()),
        desired_replicas: desired,
        available_replicas: available,
    }
}

/// Release backend keeping releases in a map
#[derive(Default)]
pub struct FakeReleases {
    releases: Mutex<BTreeMap<String, Release>>,
    calls: Mutex<Vec<String>>,
    failing: Mutex<Option<String>>,
}

impl FakeReleases {
    /// Seed a running release
    pub fn running(&self, name: &str, version: i32) {
        self.releases.lock().insert(
            name.to_string(),
            Release {
                name: name.to_string(),
                namespace: "ns".to_string(),
                version,
                chart: None,
            },
        );
    }

    /// Make every call whose verb matches `verb` fail
    pub fn fail(&self, verb: &str) {
        *self.failing.lock() = Some(verb.to_string());
    }

    /// Mutating calls so far, formatted `verb:name`
    pub fn mutations(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| !c.starts_with("list:") && !c.starts_with("get:"))
            .cloned()
            .collect()
    }

    /// Every call so far
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Current revision of a release
    pub fn version(&self, name: &str) -> Option<i32> {
        self.releases.lock().get(name).map(|r| r.version)
    }

    fn record(&self, verb: &str, name: &str) -> Result<(), Error> {
        self.calls.lock().push(format!("{verb}:{name}"));
        if self.failing.lock().as_deref() == Some(verb) {
            return Err(Error::release(name, format!("{verb} refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl ReleaseBackend for FakeReleases {
    async fn list_releases(&self, pattern: &str) -> Result<Vec<Release>, Error> {
        self.record("list", pattern)?;
        Ok(self.releases.lock().values().cloned().collect())
    }

    async fn get_release(&self, name: &str, _namespace: &str) -> Result<Option<Release>, Error> {
        self.record("get", name)?;
        Ok(self.releases.lock().get(name).cloned())
    }

    async fn install_release(
        &self,
        _chart: &[u8],
        namespace: &str,
        name: &str,
        _values: &str,
    ) -> Result<Release, Error> {
        self.record("install", name)?;
        let release = Release {
            name: name.to_string(),
            namespace: namespace.to_string(),
            version: 1,
            chart: None,
        };
        self.releases
            .lock()
            .insert(name.to_string(), release.clone());
        Ok(release)
    }

    async fn update_release(
        &self,
        name: &str,
        _namespace: &str,
        _chart: &[u8],
        _values: &str,
    ) -> Result<Release, Error> {
        self.record("update", name)?;
        let mut releases = self.releases.lock();
        let release = releases
            .get_mut(name)
            .ok_or_else(|| Error::release_not_found(name))?;
        release.version += 1;
        Ok(release.clone())
    }

    async fn delete_release(&self, name: &str, _namespace: &str, _purge: bool) -> Result<(), Error> {
        self.record("delete", name)?;
        self.releases
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::release_not_found(name))
    }
}

/// Workload provider returning whatever the test set
#[derive(Default)]
pub struct FakeWorkloads {
    workloads: Mutex<Vec<WorkloadObservation>>,
    failing: Mutex<bool>,
}

impl FakeWorkloads {
    /// Replace the observed workloads
    pub fn set(&self, workloads: Vec<WorkloadObservation>) {
        *self.workloads.lock() = workloads;
    }

    /// Make listing fail
    pub fn fail(&self) {
        *self.failing.lock() = true;
    }
}

#[async_trait]
impl WorkloadProvider for FakeWorkloads {
    async fn list_workloads(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<WorkloadObservation>, Error> {
        if *self.failing.lock() {
            return Err(Error::internal("workload cache unavailable"));
        }
        Ok(self
            .workloads
            .lock()
            .iter()
            .filter(|w| w.namespace == namespace)
            .filter(|w| selector.iter().all(|(k, v)| w.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }
}

/// Store holding migrations in a map; status writes replace the stored copy
#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<HashMap<String, Arc<Migration>>>,
    writes: Mutex<Vec<Migration>>,
    failing: Mutex<bool>,
}

impl FakeStore {
    /// Put a migration into the store
    pub fn insert(&self, migration: Migration) {
        let key = object_key(&migration.namespace().unwrap_or_default(), &migration.name_any());
        self.objects.lock().insert(key, Arc::new(migration));
    }

    /// Make status writes fail with a conflict
    pub fn fail_writes(&self) {
        *self.failing.lock() = true;
    }

    /// Every status write so far
    pub fn writes(&self) -> Vec<Migration> {
        self.writes.lock().clone()
    }

    /// Latest stored copy of `ns/name`
    pub fn current(&self, namespace: &str, name: &str) -> Option<Arc<Migration>> {
        self.get(namespace, name)
    }
}

#[async_trait]
impl MigrationStore for FakeStore {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Migration>> {
        self.objects.lock().get(&object_key(namespace, name)).cloned()
    }

    async fn update_status(&self, migration: &Migration) -> Result<Migration, Error> {
        if *self.failing.lock() {
            return Err(Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "the object has been modified".to_string(),
                reason: "Conflict".to_string(),
                code: 409,
            })));
        }
        self.writes.lock().push(migration.clone());
        self.insert(migration.clone());
        Ok(migration.clone())
    }
}

/// One published event
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    /// Warning rather than Normal
    pub warning: bool,
    /// Event reason
    pub reason: String,
    /// Event note
    pub note: Option<String>,
}

/// Event publisher that keeps every event
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    /// Reasons in publish order
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }

    /// Every recorded event
    pub fn all(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().push(RecordedEvent {
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
        });
    }
}

/// A context wired to fresh fakes, with handles to each of them
pub struct Harness {
    pub ctx: Context,
    pub releases: Arc<FakeReleases>,
    pub workloads: Arc<FakeWorkloads>,
    pub store: Arc<FakeStore>,
    pub events: Arc<RecordingEvents>,
}

impl Harness {
    pub fn new() -> Self {
        let releases = Arc::new(FakeReleases::default());
        let workloads = Arc::new(FakeWorkloads::default());
        let store = Arc::new(FakeStore::default());
        let events = Arc::new(RecordingEvents::default());
        let ctx = Context::new(
            store.clone(),
            releases.clone(),
            workloads.clone(),
            events.clone(),
        );
        Self {
            ctx,
            releases,
            workloads,
            store,
            events,
        }
    }

    /// Store `migration` and return the snapshot a worker would see
    pub fn with_migration(&self, migration: Migration) -> Arc<Migration> {
        self.store.insert(migration);
        self.snapshot()
    }

    /// Current snapshot of `ns/demo`
    pub fn snapshot(&self) -> Arc<Migration> {
        self.store
            .current("ns", "demo")
            .unwrap_or_else(|| panic!("ns/demo not in store"))
    }
}
