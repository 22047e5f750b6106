//! Resource store for Migrations
//!
//! Reads come from the watch cache so a worker always sees the latest
//! snapshot at dispatch time. The only write the controller ever makes is
//! the status subresource.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::Migration;
use crate::observer::ObjectCache;
use crate::Error;

/// Read cached Migrations and persist their status
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Shared snapshot of a Migration, `None` if it is not (or no longer) cached
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Migration>>;

    /// Owned copy of a Migration that the caller may mutate
    fn checkout(&self, namespace: &str, name: &str) -> Option<Migration> {
        self.get(namespace, name).map(|m| (*m).clone())
    }

    /// Persist the status block of `migration`
    ///
    /// # Arguments
    ///
    /// * `migration` - Object carrying the status to write; the spec is ignored
    async fn update_status(&self, migration: &Migration) -> Result<Migration, Error>;
}

/// Store backed by the Migration watch cache and the Kubernetes API
pub struct KubeMigrationStore {
    client: Client,
    cache: Arc<ObjectCache<Migration>>,
    field_manager: String,
}

impl KubeMigrationStore {
    /// Create a store reading from `cache` and writing through `client`
    pub fn new(client: Client, cache: Arc<ObjectCache<Migration>>, field_manager: &str) -> Self {
        Self {
            client,
            cache,
            field_manager: field_manager.to_string(),
        }
    }
}

#[async_trait]
impl MigrationStore for KubeMigrationStore {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Migration>> {
        self.cache.get(namespace, name)
    }

    async fn update_status(&self, migration: &Migration) -> Result<Migration, Error> {
        let namespace = migration
            .namespace()
            .ok_or_else(|| Error::validation("migration has no namespace"))?;
        let api: Api<Migration> = Api::namespaced(self.client.clone(), &namespace);

        let status_patch = serde_json::json!({
            "status": migration.status
        });

        let updated = api
            .patch_status(
                &migration.name_any(),
                &PatchParams::apply(&self.field_manager),
                &Patch::Merge(&status_patch),
            )
            .await?;

        record_write(&self.cache, &updated);
        Ok(updated)
    }
}

/// Fold a successful status write into the cache
///
/// The next pass on this Migration may start before the watch delivers the
/// write; it must still see the revisions just recorded.
pub(crate) fn record_write(cache: &ObjectCache<Migration>, written: &Migration) {
    if cache.apply_if_newer(written.clone()).is_none() {
        debug!(
            migration = %written.key(),
            resource_version = ?written.resource_version(),
            "Cache already holds a newer copy"
        );
    }
}
