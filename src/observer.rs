//! Change observer: watch a resource kind, keep a local cache of it and turn
//! raw watch events into typed notifications.
//!
//! Each watched kind gets an [`ObjectCache`] fed by [`observe`]. The cache
//! hands out `Arc<K>` snapshots; callers that need to mutate an object clone
//! it. Workers must not start before every cache reports synced, see
//! [`wait_for_cache_sync`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::keys::object_key;
use crate::Error;

const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A change to a watched object
#[derive(Debug, Clone)]
pub enum Notification<K> {
    /// Object seen for the first time
    Added(Arc<K>),
    /// Object changed; both snapshots are provided
    Updated {
        /// Snapshot before the change
        old: Arc<K>,
        /// Snapshot after the change
        new: Arc<K>,
    },
    /// Object was deleted and the final state is known
    Deleted(Arc<K>),
    /// Object disappeared while the watch was down; only the last cached
    /// state is known
    DeletedUnknown {
        /// Cache key (`namespace/name`) of the vanished object
        key: String,
        /// Last snapshot held in the cache
        last_known: Arc<K>,
    },
}

impl<K> Notification<K> {
    /// The most recent snapshot the notification carries
    pub fn object(&self) -> &Arc<K> {
        match self {
            Notification::Added(obj) | Notification::Deleted(obj) => obj,
            Notification::Updated { new, .. } => new,
            Notification::DeletedUnknown { last_known, .. } => last_known,
        }
    }
}

/// Something that can report whether its initial list completed
pub trait Synced: Send + Sync {
    /// Returns true once the first full list has been applied
    fn has_synced(&self) -> bool;
}

/// Local cache of one resource kind, keyed by `namespace/name`
pub struct ObjectCache<K> {
    objects: RwLock<HashMap<String, Arc<K>>>,
    relist: RwLock<Option<HashMap<String, Arc<K>>>>,
    synced: AtomicBool,
}

impl<K> Default for ObjectCache<K> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            relist: RwLock::new(None),
            synced: AtomicBool::new(false),
        }
    }
}

impl<K> ObjectCache<K>
where
    K: Resource + Clone,
{
    /// Create an empty, unsynced cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached snapshot of `namespace/name`
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.get_key(&object_key(namespace, name))
    }

    /// Cached snapshot by key
    pub fn get_key(&self, key: &str) -> Option<Arc<K>> {
        self.objects.read().get(key).cloned()
    }

    /// Every cached snapshot in a namespace
    pub fn list_namespace(&self, namespace: &str) -> Vec<Arc<K>> {
        self.objects
            .read()
            .values()
            .filter(|obj| obj.meta().namespace.as_deref().unwrap_or_default() == namespace)
            .cloned()
            .collect()
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace an object, returning what changed
    pub fn apply(&self, obj: K) -> Notification<K> {
        let key = cache_key(&obj);
        let new = Arc::new(obj);
        match self.objects.write().insert(key, Arc::clone(&new)) {
            Some(old) => Notification::Updated { old, new },
            None => Notification::Added(new),
        }
    }

    /// Insert `obj` unless the cache already holds this or a later
    /// resourceVersion of it
    ///
    /// Returns `None` when nothing changed. A status write folded in by the
    /// store is not replaced by its own watch echo or by an older event
    /// that arrives late.
    pub fn apply_if_newer(&self, obj: K) -> Option<Notification<K>> {
        let key = cache_key(&obj);
        let mut objects = self.objects.write();
        if let Some(current) = objects.get(&key) {
            if !is_newer(
                obj.meta().resource_version.as_deref(),
                current.meta().resource_version.as_deref(),
            ) {
                return None;
            }
        }
        let new = Arc::new(obj);
        Some(match objects.insert(key, Arc::clone(&new)) {
            Some(old) => Notification::Updated { old, new },
            None => Notification::Added(new),
        })
    }

    /// Remove an object
    pub fn delete(&self, obj: K) -> Notification<K> {
        self.objects.write().remove(&cache_key(&obj));
        Notification::Deleted(Arc::new(obj))
    }

    /// Feed one watch event into the cache
    ///
    /// A full relist (`Init` .. `InitDone`) is buffered and swapped in at
    /// `InitDone`. Objects missing from the new list produce
    /// [`Notification::DeletedUnknown`].
    pub fn handle_event(&self, event: Event<K>) -> Vec<Notification<K>> {
        match event {
            Event::Apply(obj) => self.apply_if_newer(obj).into_iter().collect(),
            Event::Delete(obj) => vec![self.delete(obj)],
            Event::Init => {
                *self.relist.write() = Some(HashMap::new());
                Vec::new()
            }
            Event::InitApply(obj) => {
                let key = cache_key(&obj);
                self.relist
                    .write()
                    .get_or_insert_with(HashMap::new)
                    .insert(key, Arc::new(obj));
                Vec::new()
            }
            Event::InitDone => {
                let listed = self.relist.write().take().unwrap_or_default();
                let notifications = self.replace(listed);
                self.synced.store(true, Ordering::Release);
                notifications
            }
        }
    }

    fn replace(&self, listed: HashMap<String, Arc<K>>) -> Vec<Notification<K>> {
        let mut objects = self.objects.write();
        let mut notifications = Vec::with_capacity(listed.len());

        for (key, last_known) in objects.iter() {
            if !listed.contains_key(key) {
                notifications.push(Notification::DeletedUnknown {
                    key: key.clone(),
                    last_known: Arc::clone(last_known),
                });
            }
        }
        for (key, new) in &listed {
            match objects.get(key) {
                Some(old) => notifications.push(Notification::Updated {
                    old: Arc::clone(old),
                    new: Arc::clone(new),
                }),
                None => notifications.push(Notification::Added(Arc::clone(new))),
            }
        }

        *objects = listed;
        notifications
    }
}

impl<K: Send + Sync> Synced for ObjectCache<K> {
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

/// resourceVersions are compared numerically when both parse; otherwise
/// any different version wins
fn is_newer(incoming: Option<&str>, current: Option<&str>) -> bool {
    if incoming.is_some() && incoming == current {
        return false;
    }
    match (
        incoming.and_then(|v| v.parse::<u64>().ok()),
        current.and_then(|v| v.parse::<u64>().ok()),
    ) {
        (Some(incoming), Some(current)) => incoming > current,
        _ => true,
    }
}

fn cache_key<K: Resource>(obj: &K) -> String {
    object_key(
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default(),
    )
}

/// Watch `api`, keep `cache` current and pass every notification to
/// `handler` until `shutdown` fires
///
/// Watch errors are logged and retried with the watcher's default backoff.
pub async fn observe<K, F>(
    api: Api<K>,
    config: watcher::Config,
    cache: Arc<ObjectCache<K>>,
    handler: F,
    shutdown: CancellationToken,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
    F: Fn(Notification<K>) + Send + Sync,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    info!(kind = %kind, "Starting watch");

    let stream = watcher::watcher(api, config).default_backoff();
    tokio::pin!(stream);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(kind = %kind, "Watch cancelled");
                break;
            }
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    for notification in cache.handle_event(event) {
                        handler(notification);
                    }
                }
                Some(Err(e)) => {
                    warn!(kind = %kind, error = %e, "Watch error, backing off");
                }
                None => {
                    warn!(kind = %kind, "Watch stream ended");
                    break;
                }
            }
        }
    }

    info!(kind = %kind, objects = cache.len(), "Watch stopped");
}

/// Wait until every cache has completed its initial list
///
/// Returns [`Error::CacheSync`] if that takes longer than `timeout`.
pub async fn wait_for_cache_sync(timeout: Duration, caches: &[&dyn Synced]) -> Result<(), Error> {
    let all_synced = async {
        while !caches.iter().all(|c| c.has_synced()) {
            tokio::time::sleep(SYNC_POLL_INTERVAL).await;
        }
    };

    tokio::time::timeout(timeout, all_synced)
        .await
        .map_err(|_| Error::cache_sync(format!("caches not synced after {timeout:?}")))
}
