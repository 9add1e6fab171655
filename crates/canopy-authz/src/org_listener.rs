//! Lazily built per-organization caches
//!
//! [`OrgRegistry`] owns one [`OrgCaches`] (authorization cache plus watch
//! hub) per organization logical cluster. Instances are created on first
//! reference; racing first references block on the same cell so exactly one
//! instance is built. Changes from the global informers are routed to the
//! instance of the object's logical cluster, if one exists.
//!
//! Membership of an organization is access to its workspace in the parent
//! cluster, so a change of that access set in the parent's cache re-evaluates
//! every watch of the child organization.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use canopy_common::cache::{Change, ScopedCache};
use canopy_common::crd::Workspace;
use canopy_common::informer::ChangeHandler;
use canopy_common::LogicalCluster;
use dashmap::DashMap;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::ResourceExt;
use once_cell::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::authorization_cache::{AuthorizationCache, CacheWatcher, ReadinessCheck};
use crate::rbac::{PolicyEvaluator, Subjects};
use crate::watch::WatchHub;

/// Global informer caches shared by every organization
#[derive(Clone)]
pub struct SharedCaches {
    /// Workspaces of every logical cluster
    pub workspaces: Arc<ScopedCache<Workspace>>,
    /// ClusterRoles of every logical cluster
    pub roles: Arc<ScopedCache<ClusterRole>>,
    /// ClusterRoleBindings of every logical cluster
    pub bindings: Arc<ScopedCache<ClusterRoleBinding>>,
    /// Extra readiness, e.g. the Role and RoleBinding informers
    pub readiness: Vec<ReadinessCheck>,
}

impl SharedCaches {
    /// Empty, unsynced caches
    pub fn new() -> Self {
        Self {
            workspaces: Arc::new(ScopedCache::new("Workspace")),
            roles: Arc::new(ScopedCache::new("ClusterRole")),
            bindings: Arc::new(ScopedCache::new("ClusterRoleBinding")),
            readiness: Vec::new(),
        }
    }
}

impl Default for SharedCaches {
    fn default() -> Self {
        Self::new()
    }
}

/// Caches of one organization
pub struct OrgCaches {
    /// Organization logical cluster
    pub cluster: LogicalCluster,
    /// Who may access which workspace
    pub authz: Arc<AuthorizationCache>,
    /// Open watches on the organization's workspaces
    pub hub: Arc<WatchHub>,
}

type Cell = Arc<OnceCell<Arc<OrgCaches>>>;

/// Registry of per-organization caches
pub struct OrgRegistry {
    shared: SharedCaches,
    evaluator: Arc<dyn PolicyEvaluator>,
    entries: DashMap<LogicalCluster, Cell>,
    built: AtomicUsize,
    this: Weak<OrgRegistry>,
}

impl OrgRegistry {
    /// Create an empty registry
    pub fn new(shared: SharedCaches, evaluator: Arc<dyn PolicyEvaluator>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            shared,
            evaluator,
            entries: DashMap::new(),
            built: AtomicUsize::new(0),
            this: this.clone(),
        })
    }

    /// Shared informer caches
    pub fn shared(&self) -> &SharedCaches {
        &self.shared
    }

    /// Policy evaluator used by every cache
    pub fn evaluator(&self) -> &Arc<dyn PolicyEvaluator> {
        &self.evaluator
    }

    /// Number of instantiated organizations
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no organization has been instantiated
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Caches of `org`, building them on first reference
    pub fn get_or_create(&self, org: &LogicalCluster) -> Arc<OrgCaches> {
        let cell: Cell = Arc::clone(self.entries.entry(org.clone()).or_default().value());
        // Built outside the map shard lock; racers wait on the cell
        let mut built = false;
        let caches = Arc::clone(cell.get_or_init(|| {
            built = true;
            self.build(org)
        }));
        if built {
            // Changes routed while the cell was unset were skipped
            caches.authz.synchronize();
        }
        caches
    }

    /// Caches of `org` if already built
    pub fn get(&self, org: &LogicalCluster) -> Option<Arc<OrgCaches>> {
        let cell: Cell = Arc::clone(self.entries.get(org)?.value());
        cell.get().cloned()
    }

    /// Root organization caches
    pub fn root(&self) -> Arc<OrgCaches> {
        self.get_or_create(&LogicalCluster::root())
    }

    /// Route a workspace change to its organization
    pub fn on_workspace(&self, change: &Change<Workspace>) {
        if let Some(org) = self.routed(change.object().as_ref()) {
            let access_changed = org.authz.on_workspace(change);
            org.hub.on_workspace(change);
            if access_changed {
                self.reevaluate_child(&org.cluster, &change.object().name_any());
            }
        }
    }

    /// Re-evaluate the watches of the organization `parent:workspace`
    fn reevaluate_child(&self, parent: &LogicalCluster, workspace: &str) {
        if let Some(child) = self.get(&parent.join(workspace)) {
            debug!(org = %child.cluster, "Organization membership changed");
            child.hub.reevaluate_all();
        }
    }

    /// Route a ClusterRole change to its organization
    pub fn on_cluster_role(&self, change: &Change<ClusterRole>) {
        if let Some(org) = self.routed(change.object().as_ref()) {
            org.authz.on_cluster_role(change);
        }
    }

    /// Route a ClusterRoleBinding change to its organization
    pub fn on_cluster_role_binding(&self, change: &Change<ClusterRoleBinding>) {
        if let Some(org) = self.routed(change.object().as_ref()) {
            org.authz.on_cluster_role_binding(change);
        }
    }

    /// Informer handler for workspaces
    pub fn workspace_handler(self: &Arc<Self>) -> ChangeHandler<Workspace> {
        let this = Arc::clone(self);
        Arc::new(move |change| this.on_workspace(change))
    }

    /// Informer handler for ClusterRoles
    pub fn cluster_role_handler(self: &Arc<Self>) -> ChangeHandler<ClusterRole> {
        let this = Arc::clone(self);
        Arc::new(move |change| this.on_cluster_role(change))
    }

    /// Informer handler for ClusterRoleBindings
    pub fn cluster_role_binding_handler(self: &Arc<Self>) -> ChangeHandler<ClusterRoleBinding> {
        let this = Arc::clone(self);
        Arc::new(move |change| this.on_cluster_role_binding(change))
    }

    /// Informer handler for Roles and RoleBindings
    pub fn namespaced_rbac_handler<K>(self: &Arc<Self>) -> ChangeHandler<K>
    where
        K: ResourceExt + Send + Sync + 'static,
    {
        let this = Arc::clone(self);
        Arc::new(move |change: &Change<K>| {
            if let Some(org) = this.routed(change.object().as_ref()) {
                org.authz.on_namespaced_rbac();
            }
        })
    }

    /// Close every watch and forget every organization when `token` fires
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        token.cancelled().await;
        self.shutdown();
    }

    /// Close every watch and forget every organization
    pub fn shutdown(&self) {
        for entry in self.entries.iter() {
            if let Some(org) = entry.value().get() {
                org.hub.close_all();
            }
        }
        self.entries.clear();
        info!("Organization caches shut down");
    }

    /// Caches responsible for an object's logical cluster
    ///
    /// An instance still being built is skipped; its builder synchronizes
    /// again once the instance is published.
    fn routed<K: ResourceExt>(&self, obj: &K) -> Option<Arc<OrgCaches>> {
        self.get(&LogicalCluster::from_object(obj))
    }

    fn build(&self, org: &LogicalCluster) -> Arc<OrgCaches> {
        let mut authz = AuthorizationCache::new(
            org.clone(),
            Arc::clone(&self.shared.workspaces),
            Arc::clone(&self.shared.roles),
            Arc::clone(&self.shared.bindings),
            Arc::clone(&self.evaluator),
        );
        for check in &self.shared.readiness {
            authz = authz.with_readiness(Arc::clone(check));
        }
        let authz = Arc::new(authz);

        let hub = Arc::new(WatchHub::new(
            org.to_string(),
            Arc::clone(&self.shared.workspaces),
            Some(org.clone()),
        ));
        authz.add_watcher(hub.clone());
        authz.add_watcher(Arc::new(OrgMembershipFanout {
            registry: self.this.clone(),
            parent: org.clone(),
        }));

        authz.synchronize();
        self.built.fetch_add(1, Ordering::Relaxed);
        info!(org = %org, "Instantiated organization caches");

        Arc::new(OrgCaches {
            cluster: org.clone(),
            authz,
            hub,
        })
    }

    #[cfg(test)]
    fn instantiations(&self) -> usize {
        self.built.load(Ordering::Relaxed)
    }
}

/// Forwards access changes in `parent` to the child organizations' watches
struct OrgMembershipFanout {
    registry: Weak<OrgRegistry>,
    parent: LogicalCluster,
}

impl CacheWatcher for OrgMembershipFanout {
    fn membership_changed(&self, workspace: &str, _subjects: &Subjects) {
        if let Some(registry) = self.registry.upgrade() {
            registry.reevaluate_child(&self.parent, workspace);
        }
    }
}
