//! Release backend abstraction
//!
//! A release is one installed instance of the Migration's chart, named
//! `<app>-<group>`. The controller never talks to a backend directly; it goes
//! through [`ReleaseBackend`] so reconciliation can be tested without a
//! cluster.

mod helm;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::Error;

pub use helm::{HelmCli, HelmConfig};

/// A release as reported by the backend
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    /// Release name (e.g. `demo-blue`)
    pub name: String,
    /// Namespace the release lives in
    pub namespace: String,
    /// Backend revision, bumped on every install or upgrade
    pub version: i32,
    /// Chart name and version, when the backend reports it
    pub chart: Option<String>,
}

/// Operations the controller needs from a release backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReleaseBackend: Send + Sync {
    /// List releases whose name matches the anchored regex `pattern`
    async fn list_releases(&self, pattern: &str) -> Result<Vec<Release>, Error>;

    /// Fetch a single release, `None` when it does not exist
    async fn get_release(&self, name: &str, namespace: &str) -> Result<Option<Release>, Error>;

    /// Install a new release from a packaged chart
    ///
    /// # Arguments
    ///
    /// * `chart` - Packaged chart archive bytes
    /// * `namespace` - Target namespace
    /// * `name` - Release name
    /// * `values` - Raw values document
    async fn install_release(
        &self,
        chart: &[u8],
        namespace: &str,
        name: &str,
        values: &str,
    ) -> Result<Release, Error>;

    /// Upgrade an existing release to the given chart and values
    async fn update_release(
        &self,
        name: &str,
        namespace: &str,
        chart: &[u8],
        values: &str,
    ) -> Result<Release, Error>;

    /// Uninstall a release
    ///
    /// Returns [`Error::ReleaseNotFound`] if the release does not exist.
    /// With `purge` false the release history is kept.
    async fn delete_release(&self, name: &str, namespace: &str, purge: bool) -> Result<(), Error>;
}
