//! Registry of in-flight watch requests.
//!
//! A long-running watch costs little while idle, but every change to the
//! resource it watches fans out to it. Work estimation for a mutating request
//! can ask how many open watches will see the change: watches on the same
//! resource in the request's namespace plus those across all namespaces.

use crate::domain::digest::RequestDigest;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

const MUTATING_VERBS: &[&str] = &["create", "update", "patch", "delete", "deletecollection"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
struct WatchKey {
    api_group: String,
    resource: String,
    /// Empty for watches across all namespaces
    namespace: String,
}

impl WatchKey {
    fn new(digest: &RequestDigest, namespace: &str) -> Self {
        Self {
            api_group: digest.api_group.clone(),
            resource: digest.resource.clone(),
            namespace: namespace.to_string(),
        }
    }
}

/// Counts open watches per resource and namespace.
///
/// Clones share the same counts.
#[derive(Debug, Clone, Default)]
pub struct WatchTracker {
    watches: Arc<DashMap<WatchKey, usize>>,
}

impl WatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `digest` as an open watch until the returned guard is dropped.
    ///
    /// Returns `None` for anything but a resource `watch` request.
    pub fn register_watch(&self, digest: &RequestDigest) -> Option<WatchGuard> {
        if !digest.is_resource_request || digest.verb != "watch" {
            return None;
        }
        let key = WatchKey::new(digest, &digest.namespace);
        *self.watches.entry(key.clone()).or_insert(0) += 1;
        Some(WatchGuard {
            watches: Arc::clone(&self.watches),
            key,
        })
    }

    /// Open watches that a mutating `digest` would notify. Zero for reads.
    pub fn interested_watch_count(&self, digest: &RequestDigest) -> usize {
        if !digest.is_resource_request || !MUTATING_VERBS.contains(&digest.verb.as_str()) {
            return 0;
        }
        let count = |namespace: &str| {
            self.watches
                .get(&WatchKey::new(digest, namespace))
                .map_or(0, |n| *n)
        };
        let cluster_wide = count("");
        if digest.namespace.is_empty() {
            cluster_wide
        } else {
            cluster_wide + count(&digest.namespace)
        }
    }

    /// Every open watch.
    pub fn open_watches(&self) -> usize {
        self.watches.iter().map(|entry| *entry.value()).sum()
    }
}

/// Keeps one watch registered. Dropping it forgets the watch.
#[derive(Debug)]
#[must_use = "the watch is forgotten as soon as the guard is dropped"]
pub struct WatchGuard {
    watches: Arc<DashMap<WatchKey, usize>>,
    key: WatchKey,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Entry::Occupied(mut entry) = self.watches.entry(std::mem::take(&mut self.key)) {
            *entry.get_mut() -= 1;
            if *entry.get() == 0 {
                entry.remove();
            }
        }
    }
}
