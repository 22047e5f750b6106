//! Supporting types for the Migration CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// What a Migration asks the operator to do with its releases
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum MigrationAction {
    /// Install releases that are not running yet
    Install,
    /// Converge running releases to the desired chart and values
    #[default]
    Update,
    /// Remove every listed release
    Delete,
}

impl std::str::FromStr for MigrationAction {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "install" => Ok(Self::Install),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(crate::Error::validation(format!(
                "invalid migration action: {s}, expected one of: Install, Update, Delete"
            ))),
        }
    }
}

impl std::fmt::Display for MigrationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Install => write!(f, "Install"),
            Self::Update => write!(f, "Update"),
            Self::Delete => write!(f, "Delete"),
        }
    }
}

/// Desired configuration of one Helm release
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseConfig {
    /// Release name, unique within the Migration (e.g. `demo-blue`)
    pub name: String,

    /// Namespace the release installs into
    pub namespace: String,

    /// Raw values document passed to the chart
    #[serde(default)]
    pub raw: String,

    /// Replica count the release's workload must reach
    #[serde(default)]
    pub replicas: i32,
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// True only for [`ConditionStatus::True`]
    pub fn is_true(&self) -> bool {
        matches!(self, Self::True)
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition, derived from the release name
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Last time the condition was probed
    pub last_probe_time: DateTime<Utc>,

    /// Last time the condition changed status
    pub last_transition_time: DateTime<Utc>,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

impl Condition {
    /// Create a new condition probed and transitioned at `now`
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            last_probe_time: now,
            last_transition_time: now,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Insert or replace the condition with the same type.
///
/// A replaced condition keeps its position in the list. Its transition
/// time is carried over when the status did not change.
pub fn upsert_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    mod migration_action {
        use super::*;

        #[test]
        fn test_from_str_case_insensitive() {
            assert_eq!(
                "install".parse::<MigrationAction>().unwrap(),
                MigrationAction::Install
            );
            assert_eq!(
                "UPDATE".parse::<MigrationAction>().unwrap(),
                MigrationAction::Update
            );
            assert_eq!(
                "Delete".parse::<MigrationAction>().unwrap(),
                MigrationAction::Delete
            );
        }

        #[test]
        fn test_from_str_invalid() {
            let err = "rollback".parse::<MigrationAction>().unwrap_err();
            assert!(err.to_string().contains("invalid migration action"));
        }

        #[test]
        fn test_serializes_as_pascal_case() {
            let json = serde_json::to_string(&MigrationAction::Delete).unwrap();
            assert_eq!(json, "\"Delete\"");
        }
    }

    mod condition_upsert {
        use super::*;

        /// Story: repeated writes for one release never duplicate its condition
        #[test]
        fn story_repeated_types_keep_one_entry_with_last_value() {
            let mut conditions = Vec::new();
            let writes = [
                ("Available-a", ConditionStatus::False, "first"),
                ("Available-b", ConditionStatus::False, "second"),
                ("Available-a", ConditionStatus::True, "third"),
                ("Available-a", ConditionStatus::False, "fourth"),
                ("Available-b", ConditionStatus::True, "fifth"),
            ];
            for (i, (type_, status, message)) in writes.iter().enumerate() {
                upsert_condition(
                    &mut conditions,
                    Condition::new(*type_, *status, "", *message, at(i as i64)),
                );
            }

            assert_eq!(conditions.len(), 2);
            let a = conditions.iter().find(|c| c.type_ == "Available-a").unwrap();
            assert_eq!(a.status, ConditionStatus::False);
            assert_eq!(a.message, "fourth");
            let b = conditions.iter().find(|c| c.type_ == "Available-b").unwrap();
            assert_eq!(b.status, ConditionStatus::True);
            assert_eq!(b.message, "fifth");
        }

        #[test]
        fn test_update_keeps_position() {
            let mut conditions = vec![
                Condition::new("x", ConditionStatus::False, "", "", at(0)),
                Condition::new("y", ConditionStatus::False, "", "", at(0)),
            ];
            upsert_condition(
                &mut conditions,
                Condition::new("x", ConditionStatus::True, "", "", at(5)),
            );
            assert_eq!(conditions[0].type_, "x");
            assert_eq!(conditions[0].status, ConditionStatus::True);
        }

        #[test]
        fn test_transition_time_kept_when_status_unchanged() {
            let mut conditions = vec![Condition::new("x", ConditionStatus::False, "", "", at(0))];
            upsert_condition(
                &mut conditions,
                Condition::new("x", ConditionStatus::False, "", "later", at(30)),
            );
            assert_eq!(conditions[0].last_transition_time, at(0));
            assert_eq!(conditions[0].last_probe_time, at(30));
        }

        #[test]
        fn test_transition_time_moves_when_status_flips() {
            let mut conditions = vec![Condition::new("x", ConditionStatus::False, "", "", at(0))];
            upsert_condition(
                &mut conditions,
                Condition::new("x", ConditionStatus::True, "", "", at(0) + Duration::seconds(9)),
            );
            assert_eq!(conditions[0].last_transition_time, at(9));
        }
    }

    #[test]
    fn test_condition_status_from_bool() {
        assert_eq!(ConditionStatus::from(true), ConditionStatus::True);
        assert_eq!(ConditionStatus::from(false), ConditionStatus::False);
        assert!(!ConditionStatus::Unknown.is_true());
    }

    #[test]
    fn test_condition_serializes_kubernetes_style() {
        let condition = Condition::new("Available-a", ConditionStatus::True, "Ready", "ok", at(0));
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "Available-a");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastProbeTime").is_some());
        assert!(json.get("lastTransitionTime").is_some());
    }
}
