//! Per-organization authorization cache
//!
//! Keeps, for one logical cluster, a reverse index from user and group to
//! the names of the workspaces they may `access`. The index is built by one
//! full pass ([`AuthorizationCache::synchronize`]) and then maintained
//! incrementally from workspace and RBAC changes: each change names the
//! workspaces it can affect and only those are re-evaluated.
//!
//! # Consistency
//!
//! Recomputations are serialized by `sync_lock` and each one evaluates policy
//! against the informer caches as they are at that moment, then publishes the
//! result under a short write lock. A result computed from an older policy
//! snapshot can therefore never replace one computed from a newer snapshot:
//! readers may see a grant late, never a revoked grant.
//!
//! `observed_generation` counts policy deltas seen; `synced_generation`
//! counts the deltas whose recomputation has been published. Each delta is
//! applied exactly once, so the two are equal only when nothing is pending.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use canopy_common::cache::{Change, ScopedCache};
use canopy_common::crd::Workspace;
use canopy_common::metrics::AUTHZ_RECOMPUTATIONS;
use canopy_common::{ClusterAwareKey, Error, LogicalCluster, Result, TENANCY_GROUP};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::ResourceExt;
use opentelemetry::KeyValue;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::rbac::{rule_resource_names, Attributes, PolicyEvaluator, Subjects, ACCESS_VERB};
use crate::user::UserInfo;

/// Extra readiness condition, e.g. an informer's `has_synced`
pub type ReadinessCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Notified after a policy change altered a workspace's subject set
pub trait CacheWatcher: Send + Sync {
    /// `subjects` is the new set of users and groups with access
    fn membership_changed(&self, workspace: &str, subjects: &Subjects);
}

/// Workspaces a change can affect
#[derive(Debug, PartialEq, Eq)]
enum Affected {
    All,
    Names(BTreeSet<String>),
}

impl Affected {
    fn none() -> Self {
        Self::Names(BTreeSet::new())
    }

    fn merge(self, other: Affected) -> Affected {
        match (self, other) {
            (Affected::Names(mut a), Affected::Names(b)) => {
                a.extend(b);
                Affected::Names(a)
            }
            _ => Affected::All,
        }
    }
}

#[derive(Default)]
struct Index {
    by_workspace: HashMap<String, Subjects>,
    by_user: HashMap<String, BTreeSet<String>>,
    by_group: HashMap<String, BTreeSet<String>>,
}

impl Index {
    /// Store the subjects of one workspace; true if anything changed
    fn set(&mut self, workspace: &str, subjects: Subjects) -> bool {
        let unchanged = match self.by_workspace.get(workspace) {
            Some(current) => *current == subjects,
            None => subjects.is_empty(),
        };
        if unchanged {
            return false;
        }
        self.remove(workspace);
        if subjects.is_empty() {
            return true;
        }
        for user in &subjects.users {
            self.by_user
                .entry(user.clone())
                .or_default()
                .insert(workspace.to_string());
        }
        for group in &subjects.groups {
            self.by_group
                .entry(group.clone())
                .or_default()
                .insert(workspace.to_string());
        }
        self.by_workspace.insert(workspace.to_string(), subjects);
        true
    }

    /// Drop a workspace; true if it had any subjects
    fn remove(&mut self, workspace: &str) -> bool {
        let Some(old) = self.by_workspace.remove(workspace) else {
            return false;
        };
        for user in &old.users {
            unlink(&mut self.by_user, user, workspace);
        }
        for group in &old.groups {
            unlink(&mut self.by_group, group, workspace);
        }
        true
    }

    fn visible_to(&self, user: &UserInfo) -> BTreeSet<String> {
        let mut names = self.by_user.get(&user.name).cloned().unwrap_or_default();
        for group in &user.groups {
            if let Some(ws) = self.by_group.get(group) {
                names.extend(ws.iter().cloned());
            }
        }
        names
    }
}

fn unlink(map: &mut HashMap<String, BTreeSet<String>>, subject: &str, workspace: &str) {
    if let Some(set) = map.get_mut(subject) {
        set.remove(workspace);
        if set.is_empty() {
            map.remove(subject);
        }
    }
}

/// Subject to visible-workspace index for one organization
pub struct AuthorizationCache {
    cluster: LogicalCluster,
    attrs: Attributes,
    workspaces: Arc<ScopedCache<Workspace>>,
    roles: Arc<ScopedCache<ClusterRole>>,
    bindings: Arc<ScopedCache<ClusterRoleBinding>>,
    evaluator: Arc<dyn PolicyEvaluator>,
    readiness: Vec<ReadinessCheck>,
    sync_lock: Mutex<()>,
    index: RwLock<Index>,
    observed_generation: AtomicU64,
    synced_generation: AtomicU64,
    initialized: AtomicBool,
    watchers: RwLock<Vec<Arc<dyn CacheWatcher>>>,
}

impl AuthorizationCache {
    /// Create an empty cache for `cluster`; call [`Self::synchronize`] to fill it
    pub fn new(
        cluster: LogicalCluster,
        workspaces: Arc<ScopedCache<Workspace>>,
        roles: Arc<ScopedCache<ClusterRole>>,
        bindings: Arc<ScopedCache<ClusterRoleBinding>>,
        evaluator: Arc<dyn PolicyEvaluator>,
    ) -> Self {
        Self {
            cluster,
            attrs: Attributes::workspace_content(ACCESS_VERB, ""),
            workspaces,
            roles,
            bindings,
            evaluator,
            readiness: Vec::new(),
            sync_lock: Mutex::new(()),
            index: RwLock::new(Index::default()),
            observed_generation: AtomicU64::new(0),
            synced_generation: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            watchers: RwLock::new(Vec::new()),
        }
    }

    /// Add a readiness condition checked by [`Self::is_ready`]
    pub fn with_readiness(mut self, check: ReadinessCheck) -> Self {
        self.readiness.push(check);
        self
    }

    /// Logical cluster this cache covers
    pub fn cluster(&self) -> &LogicalCluster {
        &self.cluster
    }

    /// Register a watcher for policy-driven membership changes
    pub fn add_watcher(&self, watcher: Arc<dyn CacheWatcher>) {
        self.watchers.write().push(watcher);
    }

    /// Initial sync has run and every underlying informer has synced
    pub fn is_ready(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
            && self.workspaces.has_synced()
            && self.roles.has_synced()
            && self.bindings.has_synced()
            && self.readiness.iter().all(|check| check())
    }

    /// Policy deltas observed so far
    pub fn observed_generation(&self) -> u64 {
        self.observed_generation.load(Ordering::Acquire)
    }

    /// Policy deltas reflected in the index
    pub fn synced_generation(&self) -> u64 {
        self.synced_generation.load(Ordering::Acquire)
    }

    /// True while observed deltas have not all been applied
    pub fn is_stale(&self) -> bool {
        self.synced_generation() < self.observed_generation()
    }

    /// Full pass over every workspace of the cluster
    pub fn synchronize(&self) {
        self.observe();
        self.recompute(Affected::All, "full_sync", false);
        self.initialized.store(true, Ordering::Release);
        info!(org = %self.cluster, "Authorization cache synchronized");
    }

    /// Names of the workspaces `user` may access
    pub fn list(&self, user: &UserInfo) -> Result<BTreeSet<String>> {
        self.ensure_ready()?;
        Ok(self.index.read().visible_to(user))
    }

    /// True if `user` may access `workspace`
    pub fn allows(&self, user: &UserInfo, workspace: &str) -> Result<bool> {
        self.ensure_ready()?;
        Ok(self
            .index
            .read()
            .by_workspace
            .get(workspace)
            .is_some_and(|s| s.includes(user)))
    }

    /// Users and groups with access to `workspace`
    pub fn subjects(&self, workspace: &str) -> Option<Subjects> {
        self.index.read().by_workspace.get(workspace).cloned()
    }

    /// Apply a workspace change of this cluster
    ///
    /// Watchers are not notified: the workspace event itself reaches the
    /// hub of this cluster. Returns true if the set of subjects with access
    /// to the workspace changed, e.g. it was created under an existing grant
    /// or deleted.
    pub fn on_workspace(&self, change: &Change<Workspace>) -> bool {
        if !self.owns(change.object().as_ref()) {
            return false;
        }
        let name = change.object().name_any();
        self.observe();
        !self
            .recompute(Affected::Names(BTreeSet::from([name])), "workspace", false)
            .is_empty()
    }

    /// Apply a ClusterRole change of this cluster
    pub fn on_cluster_role(&self, change: &Change<ClusterRole>) {
        if !self.owns(change.object().as_ref()) {
            return;
        }
        self.observe();

        let role_name = change.object().name_any();
        let bound = self
            .bindings
            .list_cluster(&self.cluster)
            .iter()
            .any(|b| b.role_ref.kind == "ClusterRole" && b.role_ref.name == role_name);
        let affected = if bound {
            let mut affected = affected_by_role(change.object());
            if let Some(old) = change.previous() {
                affected = affected.merge(affected_by_role(old));
            }
            affected
        } else {
            Affected::none()
        };
        debug!(org = %self.cluster, role = %role_name, ?affected, "ClusterRole changed");
        self.recompute(affected, "cluster_role", true);
    }

    /// Apply a ClusterRoleBinding change of this cluster
    pub fn on_cluster_role_binding(&self, change: &Change<ClusterRoleBinding>) {
        if !self.owns(change.object().as_ref()) {
            return;
        }
        self.observe();

        let mut affected = self.affected_by_binding(change.object());
        if let Some(old) = change.previous() {
            affected = affected.merge(self.affected_by_binding(old));
        }
        debug!(
            org = %self.cluster,
            binding = %change.object().name_any(),
            ?affected,
            "ClusterRoleBinding changed"
        );
        self.recompute(affected, "cluster_role_binding", true);
    }

    /// Record a Role or RoleBinding change
    ///
    /// Namespaced RBAC never grants workspace access; only the generation moves.
    pub fn on_namespaced_rbac(&self) {
        self.observe();
        self.recompute(Affected::none(), "namespaced_rbac", false);
    }

    /// Count one policy delta; it must be followed by exactly one recompute
    fn observe(&self) {
        self.observed_generation.fetch_add(1, Ordering::AcqRel);
    }

    fn owns<K: ResourceExt>(&self, obj: &K) -> bool {
        LogicalCluster::from_object(obj) == self.cluster
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::not_ready(format!("authorization cache {}", self.cluster)))
        }
    }

    fn affected_by_binding(&self, binding: &ClusterRoleBinding) -> Affected {
        if binding.role_ref.kind != "ClusterRole" {
            return Affected::none();
        }
        let key = ClusterAwareKey::new(self.cluster.clone(), binding.role_ref.name.as_str());
        match self.roles.get(&key) {
            Some(role) => affected_by_role(&role),
            None => Affected::none(),
        }
    }

    /// Re-evaluate `affected` and publish; returns the workspaces whose
    /// subject set changed
    fn recompute(&self, affected: Affected, trigger: &'static str, notify: bool) -> Vec<String> {
        let _sync = self.sync_lock.lock();

        let names: BTreeSet<String> = match affected {
            Affected::Names(names) => names,
            Affected::All => {
                let mut names: BTreeSet<String> = self
                    .workspaces
                    .list_cluster(&self.cluster)
                    .iter()
                    .map(|ws| ws.name_any())
                    .collect();
                names.extend(self.index.read().by_workspace.keys().cloned());
                names
            }
        };

        // Policy is evaluated outside the index lock; readers keep the old view meanwhile
        let computed: Vec<(String, Option<Subjects>)> = names
            .into_iter()
            .map(|name| {
                let key = ClusterAwareKey::new(self.cluster.clone(), name.as_str());
                let subjects = self.workspaces.get(&key).map(|_| {
                    self.evaluator
                        .subjects_for(&self.cluster, &self.attrs.with_name(&name))
                });
                (name, subjects)
            })
            .collect();

        let changed: Vec<String> = {
            let mut index = self.index.write();
            computed
                .into_iter()
                .filter_map(|(name, subjects)| {
                    let changed = match subjects {
                        Some(subjects) => index.set(&name, subjects),
                        None => index.remove(&name),
                    };
                    changed.then_some(name)
                })
                .collect()
        };
        // Deltas observed meanwhile are still waiting on sync_lock
        self.synced_generation.fetch_add(1, Ordering::AcqRel);

        AUTHZ_RECOMPUTATIONS.add(
            1,
            &[
                KeyValue::new("org", self.cluster.to_string()),
                KeyValue::new("trigger", trigger),
            ],
        );

        if notify && !changed.is_empty() {
            let watchers = self.watchers.read();
            for name in &changed {
                let subjects = self.subjects(name).unwrap_or_default();
                for watcher in watchers.iter() {
                    watcher.membership_changed(name, &subjects);
                }
            }
        }
        changed
    }
}

/// Workspace names a ClusterRole's rules can grant access to
fn affected_by_role(role: &ClusterRole) -> Affected {
    role.rules
        .iter()
        .flatten()
        .map(|rule| match rule_resource_names(rule, TENANCY_GROUP, "workspaces") {
            Some(names) => Affected::Names(names.into_iter().collect()),
            None => Affected::All,
        })
        .fold(Affected::none(), Affected::merge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::testing::{binding, content_role};
    use crate::rbac::{MockPolicyEvaluator, RbacEvaluator};
    use canopy_common::crd::WorkspaceSpec;
    use canopy_common::LOGICAL_CLUSTER_ANNOTATION;

    const ORG: &str = "root:acme";

    struct Fixture {
        workspaces: Arc<ScopedCache<Workspace>>,
        roles: Arc<ScopedCache<ClusterRole>>,
        bindings: Arc<ScopedCache<ClusterRoleBinding>>,
        cache: AuthorizationCache,
    }

    impl Fixture {
        fn new() -> Self {
            let roles = Arc::new(ScopedCache::new("ClusterRole"));
            let bindings = Arc::new(ScopedCache::new("ClusterRoleBinding"));
            let rbac = Arc::new(RbacEvaluator::new(roles.clone(), bindings.clone()));
            Self::with_evaluator(roles, bindings, rbac)
        }

        fn with_evaluator(
            roles: Arc<ScopedCache<ClusterRole>>,
            bindings: Arc<ScopedCache<ClusterRoleBinding>>,
            evaluator: Arc<dyn PolicyEvaluator>,
        ) -> Self {
            let workspaces = Arc::new(ScopedCache::new("Workspace"));
            workspaces.replace_all(Vec::new());
            roles.replace_all(Vec::new());
            bindings.replace_all(Vec::new());
            let cache = AuthorizationCache::new(
                LogicalCluster::new(ORG),
                workspaces.clone(),
                roles.clone(),
                bindings.clone(),
                evaluator,
            );
            Self {
                workspaces,
                roles,
                bindings,
                cache,
            }
        }

        fn add_workspace(&self, name: &str) {
            let mut ws = Workspace::new(name, WorkspaceSpec::default());
            ws.annotations_mut()
                .insert(LOGICAL_CLUSTER_ANNOTATION.to_string(), ORG.to_string());
            let change = self.workspaces.apply(ws);
            self.cache.on_workspace(&change);
        }

        fn add_role(&self, role: ClusterRole) {
            let change = self.roles.apply(role);
            self.cache.on_cluster_role(&change);
        }

        fn bind(&self, b: ClusterRoleBinding) {
            let change = self.bindings.apply(b);
            self.cache.on_cluster_role_binding(&change);
        }

        fn unbind(&self, b: &ClusterRoleBinding) {
            if let Some(change) = self.bindings.delete(b) {
                self.cache.on_cluster_role_binding(&change);
            }
        }
    }

    fn user(name: &str) -> UserInfo {
        UserInfo::new(name, Vec::<String>::new())
    }

    #[derive(Default)]
    struct RecordingWatcher(Mutex<Vec<(String, Subjects)>>);

    impl CacheWatcher for RecordingWatcher {
        fn membership_changed(&self, workspace: &str, subjects: &Subjects) {
            self.0.lock().push((workspace.to_string(), subjects.clone()));
        }
    }

    #[test]
    fn reads_fail_until_initial_sync() {
        let f = Fixture::new();
        assert!(!f.cache.is_ready());
        assert!(matches!(
            f.cache.list(&user("alice")),
            Err(Error::NotReady { .. })
        ));

        f.cache.synchronize();
        assert!(f.cache.is_ready());
        assert!(f.cache.list(&user("alice")).unwrap().is_empty());
    }

    #[test]
    fn readiness_waits_for_extra_checks() {
        let f = Fixture::new();
        let cache = AuthorizationCache::new(
            LogicalCluster::new(ORG),
            f.workspaces.clone(),
            f.roles.clone(),
            f.bindings.clone(),
            Arc::new(RbacEvaluator::new(f.roles.clone(), f.bindings.clone())),
        )
        .with_readiness(Arc::new(|| false));
        cache.synchronize();
        assert!(!cache.is_ready());
    }

    #[test]
    fn initial_sync_indexes_existing_grants() {
        let f = Fixture::new();
        f.workspaces.apply({
            let mut ws = Workspace::new("team", WorkspaceSpec::default());
            ws.annotations_mut()
                .insert(LOGICAL_CLUSTER_ANNOTATION.to_string(), ORG.to_string());
            ws
        });
        f.roles
            .apply(content_role(ORG, "team-access", &["access"], &["team"]));
        f.bindings
            .apply(binding(ORG, "team-access", "team-access", &["group:devs"]));

        f.cache.synchronize();
        let dev = UserInfo::new("bob", ["devs"]);
        assert_eq!(
            f.cache.list(&dev).unwrap(),
            BTreeSet::from(["team".to_string()])
        );
        assert!(!f.cache.is_stale());
    }

    /// Story: access is granted by a binding, observed by a watcher, and
    /// revoked again the moment the binding is removed.
    #[test]
    fn story_grant_and_revoke() {
        let f = Fixture::new();
        f.cache.synchronize();
        let watcher = Arc::new(RecordingWatcher::default());
        f.cache.add_watcher(watcher.clone());

        f.add_workspace("team");
        f.add_workspace("other");
        f.add_role(content_role(ORG, "team-access", &["access"], &["team"]));
        assert!(!f.cache.allows(&user("alice"), "team").unwrap());

        let b = binding(ORG, "team-access", "team-access", &["user:alice"]);
        f.bind(b.clone());
        assert!(f.cache.allows(&user("alice"), "team").unwrap());
        assert!(!f.cache.allows(&user("alice"), "other").unwrap());
        assert_eq!(watcher.0.lock().len(), 1);
        assert_eq!(watcher.0.lock()[0].0, "team");

        f.unbind(&b);
        assert!(!f.cache.allows(&user("alice"), "team").unwrap());
        assert!(f.cache.list(&user("alice")).unwrap().is_empty());
        assert_eq!(watcher.0.lock().len(), 2);
        assert!(watcher.0.lock()[1].1.is_empty());
        assert!(!f.cache.is_stale());
    }

    #[test]
    fn delta_observed_during_recompute_stays_stale() {
        let f = Fixture::new();
        f.cache.synchronize();

        // A second delta is counted while the first is being applied
        f.cache.observe();
        f.cache.on_namespaced_rbac();
        assert!(f.cache.is_stale());
        assert_eq!(f.cache.synced_generation() + 1, f.cache.observed_generation());

        f.cache.recompute(Affected::none(), "namespaced_rbac", false);
        assert!(!f.cache.is_stale());
    }

    #[test]
    fn workspace_changes_report_access_changes() {
        let f = Fixture::new();
        f.cache.synchronize();
        f.add_role(content_role(ORG, "all", &["access"], &[]));
        f.bind(binding(ORG, "all", "all", &["user:alice"]));

        let mut ws = Workspace::new("team", WorkspaceSpec::default());
        ws.annotations_mut()
            .insert(LOGICAL_CLUSTER_ANNOTATION.to_string(), ORG.to_string());
        assert!(f.cache.on_workspace(&f.workspaces.apply(ws.clone())));
        // Same grant, only the object changed
        assert!(!f.cache.on_workspace(&f.workspaces.apply(ws.clone())));
        let deleted = f.workspaces.delete(&ws).unwrap();
        assert!(f.cache.on_workspace(&deleted));
    }

    #[test]
    fn deleted_workspace_leaves_the_index() {
        let f = Fixture::new();
        f.cache.synchronize();
        f.add_role(content_role(ORG, "all", &["access"], &[]));
        f.bind(binding(ORG, "all", "all", &["user:alice"]));
        f.add_workspace("team");
        assert!(f.cache.allows(&user("alice"), "team").unwrap());

        let ws = f
            .workspaces
            .get(&ClusterAwareKey::new(LogicalCluster::new(ORG), "team"))
            .unwrap();
        let change = f.workspaces.delete(&ws).unwrap();
        f.cache.on_workspace(&change);
        assert!(f.cache.list(&user("alice")).unwrap().is_empty());
        assert!(f.cache.subjects("team").is_none());
    }

    #[test]
    fn changes_of_other_clusters_are_ignored() {
        let f = Fixture::new();
        f.cache.synchronize();
        let before = f.cache.observed_generation();

        let change = f
            .roles
            .apply(content_role("root:other", "r", &["access"], &[]));
        f.cache.on_cluster_role(&change);
        assert_eq!(f.cache.observed_generation(), before);
    }

    #[test]
    fn namespaced_rbac_only_moves_the_generation() {
        let f = Fixture::new();
        f.cache.synchronize();
        let before = f.cache.observed_generation();
        f.cache.on_namespaced_rbac();
        assert_eq!(f.cache.observed_generation(), before + 1);
        assert!(!f.cache.is_stale());
    }

    #[test]
    fn role_change_recomputes_only_named_workspaces() {
        let roles = Arc::new(ScopedCache::new("ClusterRole"));
        let bindings = Arc::new(ScopedCache::new("ClusterRoleBinding"));
        let mut mock = MockPolicyEvaluator::new();
        // One call per workspace in the initial sync, then only "team"
        mock.expect_subjects_for()
            .withf(|_, attrs| attrs.name.as_deref() == Some("team"))
            .times(2)
            .returning(|_, _| Subjects::default());
        mock.expect_subjects_for()
            .withf(|_, attrs| attrs.name.as_deref() == Some("other"))
            .times(1)
            .returning(|_, _| Subjects::default());
        let f = Fixture::with_evaluator(roles, bindings, Arc::new(mock));

        for name in ["team", "other"] {
            let mut ws = Workspace::new(name, WorkspaceSpec::default());
            ws.annotations_mut()
                .insert(LOGICAL_CLUSTER_ANNOTATION.to_string(), ORG.to_string());
            f.workspaces.apply(ws);
        }
        f.cache.synchronize();

        f.bindings.apply(binding(ORG, "r", "r", &["user:alice"]));
        f.add_role(content_role(ORG, "r", &["access"], &["team"]));
    }

    #[test]
    fn unbound_role_change_touches_nothing() {
        let roles = Arc::new(ScopedCache::new("ClusterRole"));
        let bindings = Arc::new(ScopedCache::new("ClusterRoleBinding"));
        let mut mock = MockPolicyEvaluator::new();
        mock.expect_subjects_for().never();
        let f = Fixture::with_evaluator(roles, bindings, Arc::new(mock));
        f.cache.synchronize();

        f.add_role(content_role(ORG, "unused", &["access"], &[]));
        assert!(!f.cache.is_stale());
    }

    #[test]
    fn affected_workspaces_of_roles() {
        let named = content_role(ORG, "r", &["access"], &["a", "b"]);
        assert_eq!(
            affected_by_role(&named),
            Affected::Names(BTreeSet::from(["a".to_string(), "b".to_string()]))
        );
        let open = content_role(ORG, "r", &["access"], &[]);
        assert_eq!(affected_by_role(&open), Affected::All);
    }
}
