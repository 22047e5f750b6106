//! Label, key and name derivation shared by every controller component
//!
//! Workloads are tied to their owning Migration by label value rather than by
//! owner reference, so the reconciler, the status projector and the event
//! correlator must agree on exactly how those strings are built. Everything
//! that turns one name into another lives here.

use std::collections::BTreeMap;

use crate::Error;

/// Label on workloads whose value is the owning Migration's name
pub const APP_LABEL: &str = "app";

/// Pod-template label carrying the Helm release name that produced a workload
pub const RELEASE_LABEL: &str = "release";

/// Prefix for per-release condition types
pub const CONDITION_TYPE_PREFIX: &str = "Available-";

/// The two physical deployment groups of a blue/green migration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeploymentGroup {
    /// The blue group
    Blue,
    /// The green group
    Green,
}

impl DeploymentGroup {
    /// All groups, in a stable order
    pub const ALL: [DeploymentGroup; 2] = [DeploymentGroup::Blue, DeploymentGroup::Green];

    /// Suffix used in release names
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Green => "green",
        }
    }
}

/// Condition type tracking one release
pub fn condition_type(release_name: &str) -> String {
    format!("{CONDITION_TYPE_PREFIX}{release_name}")
}

/// Anchored regex matching every group release of an app
///
/// Passed to the release backend's list filter.
pub fn release_pattern(app_name: &str) -> String {
    let groups: Vec<&str> = DeploymentGroup::ALL.iter().map(|g| g.as_str()).collect();
    format!("^{}-({})$", escape_regex(app_name), groups.join("|"))
}

/// Label selector matching every workload of an app
pub fn app_selector(app_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), app_name.to_string())])
}

/// Work-queue key for a namespaced object
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Split a work-queue key into `(namespace, name)`
///
/// Accepts `name` for cluster-scoped keys (empty namespace) and rejects
/// anything with more than one separator or an empty name.
pub fn split_key(key: &str) -> Result<(String, String), Error> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((String::new(), name.to_string())),
        [namespace, name] if !name.is_empty() => Ok((namespace.to_string(), name.to_string())),
        _ => Err(Error::validation(format!("invalid resource key: {key:?}"))),
    }
}

fn escape_regex(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
