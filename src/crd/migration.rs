//! Migration Custom Resource Definition
//!
//! A Migration describes the releases of one blue/green application: which
//! releases should exist, the chart they are built from, and per-release
//! values. The operator owns the status block and never writes the spec.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ConditionStatus, MigrationAction, ReleaseConfig};

/// Specification for a Migration
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "devops.symphony.io",
    version = "v1",
    kind = "Migration",
    plural = "migrations",
    shortname = "mig",
    status = "MigrationStatus",
    namespaced,
    printcolumn = r#"{"name":"App","type":"string","jsonPath":".spec.appName"}"#,
    printcolumn = r#"{"name":"Action","type":"string","jsonPath":".spec.action"}"#,
    printcolumn = r#"{"name":"Finished","type":"string","jsonPath":".status.finished"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSpec {
    /// Application name; workloads carry it in their `app` label
    pub app_name: String,

    /// What to do with the listed releases
    #[serde(default)]
    pub action: MigrationAction,

    /// Packaged chart archive shared by every release
    #[serde(default, with = "base64_bytes")]
    #[schemars(with = "String")]
    pub chart: Vec<u8>,

    /// Desired releases, processed in order
    #[serde(default)]
    pub releases: Vec<ReleaseConfig>,
}

impl MigrationSpec {
    /// Find the desired release with the given name
    pub fn release(&self, name: &str) -> Option<&ReleaseConfig> {
        self.releases.iter().find(|r| r.name == name)
    }

    /// Validate the spec before any backend call is made
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.app_name.is_empty() {
            return Err(crate::Error::validation("app name must be specified"));
        }

        let mut seen = std::collections::BTreeSet::new();
        for release in &self.releases {
            if release.name.is_empty() {
                return Err(crate::Error::validation("release name must be specified"));
            }
            if !seen.insert(release.name.as_str()) {
                return Err(crate::Error::validation(format!(
                    "duplicate release name: {}",
                    release.name
                )));
            }
        }

        Ok(())
    }
}

/// Status for a Migration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    /// Whether every release has converged
    #[serde(default = "not_finished")]
    pub finished: ConditionStatus,

    /// One condition per release, keyed by type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Backend revision the operator last drove each release to
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub release_revision: BTreeMap<String, i32>,

    /// Last time the status was refreshed while not finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

fn not_finished() -> ConditionStatus {
    ConditionStatus::False
}

impl Default for MigrationStatus {
    fn default() -> Self {
        Self {
            finished: not_finished(),
            conditions: Vec::new(),
            release_revision: BTreeMap::new(),
            last_update_time: None,
        }
    }
}

impl MigrationStatus {
    /// Returns true once the migration has converged
    pub fn is_finished(&self) -> bool {
        self.finished.is_true()
    }

    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Tracked revision for a release
    pub fn revision(&self, release: &str) -> Option<i32> {
        self.release_revision.get(release).copied()
    }
}

impl Migration {
    /// Returns true when the migration has converged
    pub fn is_finished(&self) -> bool {
        self.status.as_ref().is_some_and(MigrationStatus::is_finished)
    }

    /// Returns true when the object is being deleted
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Tracked revision for a release, if any
    pub fn tracked_revision(&self, release: &str) -> Option<i32> {
        self.status.as_ref().and_then(|s| s.revision(release))
    }

    /// Work-queue key (`namespace/name`)
    pub fn key(&self) -> String {
        crate::keys::object_key(&self.namespace().unwrap_or_default(), &self.name_any())
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn sample_spec() -> MigrationSpec {
        MigrationSpec {
            app_name: "demo".to_string(),
            action: MigrationAction::Update,
            chart: b"chart-bytes".to_vec(),
            releases: vec![
                ReleaseConfig {
                    name: "demo-blue".to_string(),
                    namespace: "ns".to_string(),
                    raw: "replicaCount: 2".to_string(),
                    replicas: 2,
                },
                ReleaseConfig {
                    name: "demo-green".to_string(),
                    namespace: "ns".to_string(),
                    raw: "replicaCount: 2".to_string(),
                    replicas: 2,
                },
            ],
        }
    }

    /// Story: the chart archive travels as base64 like any Kubernetes byte field
    #[test]
    fn story_chart_round_trips_as_base64() {
        let spec = sample_spec();
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["chart"], "Y2hhcnQtYnl0ZXM=");
        assert_eq!(json["appName"], "demo");

        let back: MigrationSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back.chart, b"chart-bytes");
    }

    #[test]
    fn test_missing_chart_and_action_default() {
        let spec: MigrationSpec =
            serde_json::from_value(serde_json::json!({ "appName": "demo" })).unwrap();
        assert!(spec.chart.is_empty());
        assert_eq!(spec.action, MigrationAction::Update);
        assert!(spec.releases.is_empty());
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let result: Result<MigrationSpec, _> =
            serde_json::from_value(serde_json::json!({ "appName": "demo", "chart": "%%%" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_requires_app_name() {
        let mut spec = sample_spec();
        spec.app_name.clear();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("app name must be specified"));
    }

    #[test]
    fn test_validate_rejects_duplicate_release_names() {
        let mut spec = sample_spec();
        spec.releases[1].name = "demo-blue".to_string();
        assert!(spec.validate().is_err());
        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn test_release_lookup() {
        let spec = sample_spec();
        assert_eq!(spec.release("demo-green").unwrap().replicas, 2);
        assert!(spec.release("demo-red").is_none());
    }

    #[test]
    fn test_status_defaults_to_not_finished() {
        let status: MigrationStatus = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(status.finished, ConditionStatus::False);
        assert_eq!(MigrationStatus::default().finished, ConditionStatus::False);
    }

    #[test]
    fn test_migration_helpers() {
        let mut migration = Migration::new("demo", sample_spec());
        migration.metadata.namespace = Some("ns".to_string());
        assert_eq!(migration.key(), "ns/demo");
        assert!(!migration.is_finished());
        assert!(!migration.is_being_deleted());
        assert_eq!(migration.tracked_revision("demo-blue"), None);

        let mut status = MigrationStatus {
            finished: ConditionStatus::True,
            ..Default::default()
        };
        status.release_revision.insert("demo-blue".to_string(), 3);
        migration.status = Some(status);
        assert!(migration.is_finished());
        assert_eq!(migration.tracked_revision("demo-blue"), Some(3));
    }

    #[test]
    fn test_crd_metadata() {
        let crd = Migration::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("migrations.devops.symphony.io")
        );
        assert_eq!(crd.spec.scope, "Namespaced");
    }
}
