//! Cluster-aware object caches fed by kube watchers
//!
//! A [`ScopedCache`] holds the latest copy of every object of one kind, keyed
//! by [`ClusterAwareKey`]. It consumes raw [`watcher::Event`]s and turns them
//! into [`Change`]s, so handlers see "added / updated (old, new) / deleted"
//! rather than watch plumbing. Re-lists (`Init .. InitDone`) are diffed
//! against the current contents so objects deleted while the watch was
//! down still surface as deletions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use kube::runtime::watcher;
use kube::Resource;
use parking_lot::Mutex;

use crate::logicalcluster::{ClusterAwareKey, LogicalCluster};

/// A single observed change to a cached object
#[derive(Debug)]
pub enum Change<K> {
    /// Object seen for the first time
    Added(Arc<K>),
    /// Object replaced; `old` is the previous cached copy
    Updated {
        /// Previously cached copy
        old: Arc<K>,
        /// Newly observed copy
        new: Arc<K>,
    },
    /// Object removed; carries the last known copy
    Deleted(Arc<K>),
}

impl<K> Change<K> {
    /// The most recent copy of the object
    pub fn object(&self) -> &Arc<K> {
        match self {
            Change::Added(obj) | Change::Deleted(obj) => obj,
            Change::Updated { new, .. } => new,
        }
    }

    /// Previous copy, if the object existed before this change
    pub fn previous(&self) -> Option<&Arc<K>> {
        match self {
            Change::Added(_) => None,
            Change::Updated { old, .. } => Some(old),
            Change::Deleted(obj) => Some(obj),
        }
    }
}

impl<K> Clone for Change<K> {
    fn clone(&self) -> Self {
        match self {
            Change::Added(o) => Change::Added(Arc::clone(o)),
            Change::Updated { old, new } => Change::Updated {
                old: Arc::clone(old),
                new: Arc::clone(new),
            },
            Change::Deleted(o) => Change::Deleted(Arc::clone(o)),
        }
    }
}

/// Concurrent cache of one resource kind across all logical clusters
pub struct ScopedCache<K> {
    kind: &'static str,
    store: DashMap<ClusterAwareKey, Arc<K>>,
    synced: AtomicBool,
    relist: Mutex<Option<HashMap<ClusterAwareKey, Arc<K>>>>,
}

impl<K> ScopedCache<K>
where
    K: Resource + Clone,
{
    /// Create an empty, unsynced cache
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            store: DashMap::new(),
            synced: AtomicBool::new(false),
            relist: Mutex::new(None),
        }
    }

    /// Resource kind held by this cache
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// True once the first full list has been applied
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Look up an object by key
    pub fn get(&self, key: &ClusterAwareKey) -> Option<Arc<K>> {
        self.store.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Every cached object
    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Every cached object in one logical cluster
    pub fn list_cluster(&self, cluster: &LogicalCluster) -> Vec<Arc<K>> {
        self.list_filtered(|key, _| &key.cluster == cluster)
    }

    /// Cached objects matching a predicate
    pub fn list_filtered<F>(&self, mut pred: F) -> Vec<Arc<K>>
    where
        F: FnMut(&ClusterAwareKey, &K) -> bool,
    {
        self.store
            .iter()
            .filter(|e| pred(e.key(), e.value()))
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Insert or replace an object
    pub fn apply(&self, obj: K) -> Change<K> {
        let key = ClusterAwareKey::from_object(&obj);
        let new = Arc::new(obj);
        match self.store.insert(key, Arc::clone(&new)) {
            Some(old) => Change::Updated { old, new },
            None => Change::Added(new),
        }
    }

    /// Remove an object; `None` if it was never cached
    pub fn delete(&self, obj: &K) -> Option<Change<K>> {
        let key = ClusterAwareKey::from_object(obj);
        self.store
            .remove(&key)
            .map(|(_, last)| Change::Deleted(last))
    }

    /// Replace the full contents, diffing against what was cached
    ///
    /// Marks the cache synced.
    pub fn replace_all(&self, objs: impl IntoIterator<Item = K>) -> Vec<Change<K>> {
        let fresh: HashMap<_, _> = objs
            .into_iter()
            .map(|o| (ClusterAwareKey::from_object(&o), Arc::new(o)))
            .collect();
        self.swap_in(fresh)
    }

    /// Fold one watcher event into the cache
    pub fn handle_event(&self, event: watcher::Event<K>) -> Vec<Change<K>> {
        match event {
            watcher::Event::Apply(obj) => vec![self.apply(obj)],
            watcher::Event::Delete(obj) => self.delete(&obj).into_iter().collect(),
            watcher::Event::Init => {
                *self.relist.lock() = Some(HashMap::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                let key = ClusterAwareKey::from_object(&obj);
                let mut relist = self.relist.lock();
                relist
                    .get_or_insert_with(HashMap::new)
                    .insert(key, Arc::new(obj));
                Vec::new()
            }
            watcher::Event::InitDone => {
                let fresh = self.relist.lock().take().unwrap_or_default();
                self.swap_in(fresh)
            }
        }
    }

    fn swap_in(&self, fresh: HashMap<ClusterAwareKey, Arc<K>>) -> Vec<Change<K>> {
        let mut changes = Vec::new();

        let gone: Vec<ClusterAwareKey> = self
            .store
            .iter()
            .filter(|e| !fresh.contains_key(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for key in gone {
            if let Some((_, last)) = self.store.remove(&key) {
                changes.push(Change::Deleted(last));
            }
        }

        for (key, new) in fresh {
            match self.store.insert(key, Arc::clone(&new)) {
                Some(old) => changes.push(Change::Updated { old, new }),
                None => changes.push(Change::Added(new)),
            }
        }

        self.synced.store(true, Ordering::Release);
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LOGICAL_CLUSTER_ANNOTATION;
    use k8s_openapi::api::core::v1::Namespace;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn ns(cluster: &str, name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(BTreeMap::from([(
                    LOGICAL_CLUSTER_ANNOTATION.to_string(),
                    cluster.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn key(cluster: &str, name: &str) -> ClusterAwareKey {
        ClusterAwareKey::new(LogicalCluster::new(cluster), name)
    }

    #[test]
    fn same_name_in_two_clusters_are_distinct() {
        let cache = ScopedCache::new("Namespace");
        cache.apply(ns("root:a", "default"));
        cache.apply(ns("root:b", "default"));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.list_cluster(&LogicalCluster::new("root:a")).len(), 1);
        assert!(cache.get(&key("root:b", "default")).is_some());
    }

    #[test]
    fn apply_reports_added_then_updated() {
        let cache = ScopedCache::new("Namespace");
        assert!(matches!(cache.apply(ns("root:a", "x")), Change::Added(_)));
        match cache.apply(ns("root:a", "x")) {
            Change::Updated { old, .. } => assert_eq!(old.metadata.name.as_deref(), Some("x")),
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn deleting_unknown_object_is_silent() {
        let cache: ScopedCache<Namespace> = ScopedCache::new("Namespace");
        assert!(cache.delete(&ns("root:a", "x")).is_none());
    }

    /// Story: an object deleted while the watch was disconnected still
    /// produces a deletion once the re-list completes.
    #[test]
    fn story_relist_surfaces_missed_deletions() {
        let cache = ScopedCache::new("Namespace");
        assert!(!cache.has_synced());

        cache.handle_event(watcher::Event::Init);
        cache.handle_event(watcher::Event::InitApply(ns("root:a", "keep")));
        cache.handle_event(watcher::Event::InitApply(ns("root:a", "gone")));
        let first = cache.handle_event(watcher::Event::InitDone);
        assert_eq!(first.len(), 2);
        assert!(cache.has_synced());

        // Watch drops, "gone" is deleted, watch re-lists
        cache.handle_event(watcher::Event::Init);
        cache.handle_event(watcher::Event::InitApply(ns("root:a", "keep")));
        let second = cache.handle_event(watcher::Event::InitDone);

        let deleted: Vec<_> = second
            .iter()
            .filter_map(|c| match c {
                Change::Deleted(o) => o.metadata.name.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(deleted, vec!["gone".to_string()]);
        assert!(cache.get(&key("root:a", "gone")).is_none());
        assert!(cache.get(&key("root:a", "keep")).is_some());
    }

    #[test]
    fn objects_are_invisible_until_init_done() {
        let cache = ScopedCache::new("Namespace");
        cache.handle_event(watcher::Event::Init);
        cache.handle_event(watcher::Event::InitApply(ns("root:a", "x")));
        assert!(cache.is_empty());
        cache.handle_event(watcher::Event::InitDone);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn replace_all_marks_synced() {
        let cache = ScopedCache::new("Namespace");
        let changes = cache.replace_all(vec![ns("root:a", "x")]);
        assert_eq!(changes.len(), 1);
        assert!(cache.has_synced());
    }
}
