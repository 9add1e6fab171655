//! Per-caller workspace watches
//!
//! A [`WatchHub`] turns raw workspace changes into the events one caller
//! should see. Every watcher carries a visibility predicate and remembers
//! which workspaces it has been shown; each raw event is re-tagged from the
//! previous and current visibility alone:
//!
//! | shown before | visible now | emitted  |
//! |--------------|-------------|----------|
//! | no           | no          | nothing  |
//! | no           | yes         | ADDED    |
//! | yes          | no          | DELETED  |
//! | yes          | yes         | MODIFIED |
//!
//! Visibility can also change without any workspace event (a binding was
//! added or removed); the hub is a [`CacheWatcher`] so those changes are
//! re-evaluated the same way.
//!
//! Each watcher gets a bounded channel. A watcher that falls so far behind
//! that its channel is full is terminated; the client re-lists and watches
//! again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use canopy_common::cache::{Change, ScopedCache};
use canopy_common::crd::Workspace;
use canopy_common::metrics::AUTHZ_WATCHERS_TERMINATED;
use canopy_common::{ClusterAwareKey, LogicalCluster};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::authorization_cache::CacheWatcher;
use crate::rbac::Subjects;

/// Events a watcher may fall behind by before it is terminated
pub const DEFAULT_WATCH_BUFFER: usize = 256;

/// Decides whether a caller may see a workspace
pub type Visibility = Arc<dyn Fn(&Workspace) -> bool + Send + Sync>;

/// Kubernetes watch event type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// Object entered the caller's view
    Added,
    /// Visible object changed
    Modified,
    /// Object left the caller's view
    Deleted,
}

impl EventType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
        }
    }
}

/// One event delivered to a watcher
#[derive(Clone, Debug)]
pub struct WatchEvent {
    /// Event type after re-tagging
    pub type_: EventType,
    /// The workspace
    pub object: Arc<Workspace>,
}

impl WatchEvent {
    /// `{"type": ..., "object": ...}` as sent on a watch stream
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.type_.as_str(),
            "object": self.object.as_ref(),
        })
    }
}

/// Event a watcher sees given its previous and current visibility
pub fn retag(shown_before: bool, visible_now: bool) -> Option<EventType> {
    match (shown_before, visible_now) {
        (false, false) => None,
        (false, true) => Some(EventType::Added),
        (true, false) => Some(EventType::Deleted),
        (true, true) => Some(EventType::Modified),
    }
}

struct Watcher {
    visible: Visibility,
    sender: mpsc::Sender<WatchEvent>,
    shown: HashSet<ClusterAwareKey>,
}

enum Delivery {
    Delivered,
    Slow,
    Closed,
}

impl Watcher {
    /// Re-tag and deliver one observation
    fn observe(&mut self, key: &ClusterAwareKey, object: &Arc<Workspace>, exists: bool) -> Delivery {
        let before = self.shown.contains(key);
        let now = exists && (self.visible)(object);
        let Some(type_) = retag(before, now) else {
            return Delivery::Delivered;
        };
        let event = WatchEvent {
            type_,
            object: Arc::clone(object),
        };
        match self.sender.try_send(event) {
            Ok(()) => {
                if now {
                    self.shown.insert(key.clone());
                } else {
                    self.shown.remove(key);
                }
                Delivery::Delivered
            }
            Err(TrySendError::Full(_)) => Delivery::Slow,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Fans workspace changes out to per-caller watches
pub struct WatchHub {
    label: String,
    workspaces: Arc<ScopedCache<Workspace>>,
    scope: Option<LogicalCluster>,
    buffer: usize,
    next_id: AtomicU64,
    watchers: Mutex<HashMap<u64, Watcher>>,
}

impl WatchHub {
    /// Hub over the workspaces of `scope`, or of every cluster for `None`
    pub fn new(
        label: impl Into<String>,
        workspaces: Arc<ScopedCache<Workspace>>,
        scope: Option<LogicalCluster>,
    ) -> Self {
        Self {
            label: label.into(),
            workspaces,
            scope,
            buffer: DEFAULT_WATCH_BUFFER,
            next_id: AtomicU64::new(0),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Override the per-watcher event buffer
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Number of open watchers
    pub fn len(&self) -> usize {
        self.watchers.lock().len()
    }

    /// True if no watcher is open
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a watch
    ///
    /// With `initial_events` the currently visible workspaces are sent first
    /// as ADDED; a client resuming from a resourceVersion skips them. Either
    /// way the watcher starts out knowing what is visible, so later events
    /// are re-tagged correctly.
    pub fn watch(&self, visible: Visibility, initial_events: bool) -> mpsc::Receiver<WatchEvent> {
        let mut watchers = self.watchers.lock();

        let current: Vec<Arc<Workspace>> = self
            .in_scope()
            .into_iter()
            .filter(|ws| visible(ws))
            .collect();
        let (sender, receiver) = mpsc::channel(current.len() + self.buffer);

        let mut shown = HashSet::with_capacity(current.len());
        for ws in current {
            shown.insert(ClusterAwareKey::from_object(ws.as_ref()));
            if initial_events {
                // Capacity covers the initial set
                let _ = sender.try_send(WatchEvent {
                    type_: EventType::Added,
                    object: ws,
                });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        watchers.insert(
            id,
            Watcher {
                visible,
                sender,
                shown,
            },
        );
        debug!(hub = %self.label, watcher = id, "Watch opened");
        receiver
    }

    /// Deliver a workspace change
    pub fn on_workspace(&self, change: &Change<Workspace>) {
        let object = change.object();
        let key = ClusterAwareKey::from_object(object.as_ref());
        if !self.covers(&key.cluster) {
            return;
        }
        let exists = !matches!(change, Change::Deleted(_));
        self.deliver(|watcher| watcher.observe(&key, object, exists));
    }

    /// Re-evaluate one workspace for every watcher after a policy change
    pub fn reevaluate(&self, key: &ClusterAwareKey) {
        if !self.covers(&key.cluster) {
            return;
        }
        // A vanished workspace is reported by its own delete event
        let Some(object) = self.workspaces.get(key) else {
            return;
        };
        self.deliver(|watcher| watcher.observe(key, &object, true));
    }

    /// Re-evaluate every workspace in scope for every watcher
    pub fn reevaluate_all(&self) {
        for ws in self.in_scope() {
            let key = ClusterAwareKey::from_object(ws.as_ref());
            self.deliver(|watcher| watcher.observe(&key, &ws, true));
        }
    }

    /// Close every watch
    pub fn close_all(&self) {
        let closed = {
            let mut watchers = self.watchers.lock();
            let n = watchers.len();
            watchers.clear();
            n
        };
        if closed > 0 {
            debug!(hub = %self.label, closed, "Closed all watches");
        }
    }

    fn covers(&self, cluster: &LogicalCluster) -> bool {
        self.scope.as_ref().is_none_or(|scope| scope == cluster)
    }

    fn in_scope(&self) -> Vec<Arc<Workspace>> {
        match &self.scope {
            Some(scope) => self.workspaces.list_cluster(scope),
            None => self.workspaces.list(),
        }
    }

    fn deliver<F>(&self, mut observe: F)
    where
        F: FnMut(&mut Watcher) -> Delivery,
    {
        let mut watchers = self.watchers.lock();
        watchers.retain(|id, watcher| match observe(watcher) {
            Delivery::Delivered => true,
            Delivery::Slow => {
                AUTHZ_WATCHERS_TERMINATED.add(1, &[]);
                warn!(hub = %self.label, watcher = id, "Terminating slow watcher");
                false
            }
            Delivery::Closed => {
                debug!(hub = %self.label, watcher = id, "Watch closed by client");
                false
            }
        });
    }
}

impl CacheWatcher for WatchHub {
    fn membership_changed(&self, workspace: &str, _subjects: &Subjects) {
        if let Some(scope) = &self.scope {
            self.reevaluate(&ClusterAwareKey::new(scope.clone(), workspace));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_common::crd::WorkspaceSpec;
    use canopy_common::LOGICAL_CLUSTER_ANNOTATION;
    use kube::ResourceExt;
    use parking_lot::RwLock;
    use rstest::rstest;
    use std::collections::BTreeSet;

    const ORG: &str = "root:acme";

    fn workspace(name: &str) -> Workspace {
        let mut ws = Workspace::new(name, WorkspaceSpec::default());
        ws.annotations_mut()
            .insert(LOGICAL_CLUSTER_ANNOTATION.to_string(), ORG.to_string());
        ws
    }

    /// Visibility driven by a mutable allow-list
    fn allow_list() -> (Visibility, Arc<RwLock<BTreeSet<String>>>) {
        let allowed = Arc::new(RwLock::new(BTreeSet::new()));
        let check = allowed.clone();
        (
            Arc::new(move |ws: &Workspace| check.read().contains(&ws.name_any())),
            allowed,
        )
    }

    fn hub() -> (WatchHub, Arc<ScopedCache<Workspace>>) {
        let cache = Arc::new(ScopedCache::new("Workspace"));
        (
            WatchHub::new(ORG, cache.clone(), Some(LogicalCluster::new(ORG))),
            cache,
        )
    }

    fn drain(rx: &mut mpsc::Receiver<WatchEvent>) -> Vec<(EventType, String)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push((event.type_, event.object.name_any()));
        }
        out
    }

    #[rstest]
    #[case::invisible(false, false, None)]
    #[case::entered(false, true, Some(EventType::Added))]
    #[case::left(true, false, Some(EventType::Deleted))]
    #[case::stayed(true, true, Some(EventType::Modified))]
    fn retag_table(#[case] before: bool, #[case] now: bool, #[case] expected: Option<EventType>) {
        assert_eq!(retag(before, now), expected);
    }

    #[test]
    fn initial_events_list_the_visible_set() {
        let (hub, cache) = hub();
        cache.apply(workspace("a"));
        cache.apply(workspace("b"));
        let (visible, allowed) = allow_list();
        allowed.write().insert("a".to_string());

        let mut rx = hub.watch(visible.clone(), true);
        assert_eq!(drain(&mut rx), vec![(EventType::Added, "a".to_string())]);

        // Resuming skips the initial set but still knows "a" was shown
        let mut resumed = hub.watch(visible, false);
        assert!(drain(&mut resumed).is_empty());
        let change = cache.apply(workspace("a"));
        hub.on_workspace(&change);
        assert_eq!(
            drain(&mut resumed),
            vec![(EventType::Modified, "a".to_string())]
        );
    }

    /// Story: a caller watches while access is granted, the workspace is
    /// modified, then access is revoked. The raw events are all
    /// modifications but the caller sees the workspace arrive and leave.
    #[test]
    fn story_visibility_transitions_are_retagged() {
        let (hub, cache) = hub();
        let (visible, allowed) = allow_list();
        let mut rx = hub.watch(visible, true);

        let change = cache.apply(workspace("team"));
        hub.on_workspace(&change);
        assert!(drain(&mut rx).is_empty());

        allowed.write().insert("team".to_string());
        hub.membership_changed("team", &Subjects::default());
        assert_eq!(drain(&mut rx), vec![(EventType::Added, "team".to_string())]);

        let change = cache.apply(workspace("team"));
        hub.on_workspace(&change);
        assert_eq!(
            drain(&mut rx),
            vec![(EventType::Modified, "team".to_string())]
        );

        allowed.write().clear();
        hub.reevaluate_all();
        assert_eq!(
            drain(&mut rx),
            vec![(EventType::Deleted, "team".to_string())]
        );

        let change = cache.delete(&workspace("team")).unwrap();
        hub.on_workspace(&change);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn deletion_of_a_visible_workspace_is_delivered() {
        let (hub, cache) = hub();
        let (visible, allowed) = allow_list();
        allowed.write().insert("team".to_string());
        cache.apply(workspace("team"));
        let mut rx = hub.watch(visible, false);

        let change = cache.delete(&workspace("team")).unwrap();
        hub.on_workspace(&change);
        assert_eq!(
            drain(&mut rx),
            vec![(EventType::Deleted, "team".to_string())]
        );
    }

    #[test]
    fn other_clusters_are_ignored() {
        let (hub, cache) = hub();
        let mut rx = hub.watch(Arc::new(|_: &Workspace| true), true);
        let mut other = Workspace::new("x", WorkspaceSpec::default());
        other
            .annotations_mut()
            .insert(LOGICAL_CLUSTER_ANNOTATION.to_string(), "root:other".into());
        let change = cache.apply(other);
        hub.on_workspace(&change);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn slow_watchers_are_terminated() {
        let cache = Arc::new(ScopedCache::new("Workspace"));
        let hub = WatchHub::new(ORG, cache.clone(), Some(LogicalCluster::new(ORG))).with_buffer(2);
        let mut rx = hub.watch(Arc::new(|_: &Workspace| true), true);

        for name in ["a", "b", "c"] {
            let change = cache.apply(workspace(name));
            hub.on_workspace(&change);
        }
        assert!(hub.is_empty());

        // Buffered events are still readable, then the stream ends
        assert_eq!(drain(&mut rx).len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_receivers_are_pruned() {
        let (hub, cache) = hub();
        let rx = hub.watch(Arc::new(|_: &Workspace| true), true);
        drop(rx);
        let change = cache.apply(workspace("a"));
        hub.on_workspace(&change);
        assert!(hub.is_empty());
    }
}
