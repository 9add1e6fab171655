//! Scoped workspace access
//!
//! Resolves a [`ScopedPath`] to the organization's caches and serves list,
//! get and watch filtered by what the caller may see. Object data always
//! comes from the shared workspace informer cache; the authorization cache
//! only decides visibility.

use std::sync::Arc;

use canopy_common::crd::Workspace;
use canopy_common::{ClusterAwareKey, LogicalCluster};
use kube::ResourceExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::org_listener::{OrgCaches, OrgRegistry};
use crate::scope::{AllScopePolicy, Scope, ScopedPath};
use crate::user::UserInfo;
use crate::watch::{Visibility, WatchEvent};

/// Request-scoped facade over the organization registry
pub struct ScopedAccess {
    registry: Arc<OrgRegistry>,
    policy: AllScopePolicy,
}

impl ScopedAccess {
    /// Serve through `registry`, applying `policy` to the `all` scope
    pub fn new(registry: Arc<OrgRegistry>, policy: AllScopePolicy) -> Self {
        Self { registry, policy }
    }

    /// The underlying registry
    pub fn registry(&self) -> &Arc<OrgRegistry> {
        &self.registry
    }

    /// Workspaces visible to `user`, sorted by name
    pub fn list(&self, user: &UserInfo, path: &ScopedPath) -> Result<Vec<Arc<Workspace>>> {
        let org = self.resolve(&path.org)?;

        let mut items = if self.per_workspace(path) {
            org.authz
                .list(user)?
                .into_iter()
                .filter_map(|name| {
                    let key = ClusterAwareKey::new(org.cluster.clone(), name);
                    self.registry.shared().workspaces.get(&key)
                })
                .collect()
        } else {
            let visible = self.visibility(user, path, &org)?;
            self.registry
                .shared()
                .workspaces
                .list_cluster(&org.cluster)
                .into_iter()
                .filter(|ws| visible(ws))
                .collect::<Vec<_>>()
        };
        items.sort_by_key(|ws| ws.name_any());

        debug!(
            user = %user.name,
            org = %org.cluster,
            scope = %path.scope,
            count = items.len(),
            "Listed workspaces"
        );
        Ok(items)
    }

    /// One workspace; invisible and missing are indistinguishable
    pub fn get(&self, user: &UserInfo, path: &ScopedPath, name: &str) -> Result<Arc<Workspace>> {
        let org = self.resolve(&path.org)?;
        let visible = self.visibility(user, path, &org)?;
        let key = ClusterAwareKey::new(org.cluster.clone(), name);
        self.registry
            .shared()
            .workspaces
            .get(&key)
            .filter(|ws| visible(ws))
            .ok_or_else(|| Error::workspace_not_found(name))
    }

    /// Open a watch of the workspaces visible to `user`
    pub fn watch(
        &self,
        user: &UserInfo,
        path: &ScopedPath,
        initial_events: bool,
    ) -> Result<mpsc::Receiver<WatchEvent>> {
        let org = self.resolve(&path.org)?;
        let visible = self.visibility(user, path, &org)?;
        Ok(org.hub.watch(visible, initial_events))
    }

    fn per_workspace(&self, path: &ScopedPath) -> bool {
        path.scope == Scope::Personal
            || self.policy == AllScopePolicy::PerWorkspaceAccess
            || path.org.is_root()
    }

    /// Caches of an organization that exists
    fn resolve(&self, org: &LogicalCluster) -> Result<Arc<OrgCaches>> {
        let workspaces = &self.registry.shared().workspaces;
        if !workspaces.has_synced() {
            return Err(Error::NotReady("workspace informer".to_string()));
        }
        if let Some(parent) = org.parent() {
            let key = ClusterAwareKey::new(parent, org.base());
            if workspaces.get(&key).is_none() {
                return Err(Error::workspace_not_found(org.base()));
            }
        }
        let caches = self.registry.get_or_create(org);
        if !caches.authz.is_ready() {
            return Err(Error::NotReady(format!("authorization cache {org}")));
        }
        Ok(caches)
    }

    fn visibility(&self, user: &UserInfo, path: &ScopedPath, org: &OrgCaches) -> Result<Visibility> {
        let user = user.clone();
        if self.per_workspace(path) {
            let authz = Arc::clone(&org.authz);
            return Ok(Arc::new(move |ws: &Workspace| {
                authz.allows(&user, &ws.name_any()).unwrap_or(false)
            }));
        }

        // Membership of a non-root org is access to its workspace in the parent
        let parent_cluster = org
            .cluster
            .parent()
            .ok_or_else(|| Error::workspace_not_found(org.cluster.base()))?;
        let parent = self.registry.get_or_create(&parent_cluster);
        if !parent.authz.is_ready() {
            return Err(Error::NotReady(format!("authorization cache {parent_cluster}")));
        }
        let org_name = org.cluster.base().to_string();
        Ok(Arc::new(move |_: &Workspace| {
            parent.authz.allows(&user, &org_name).unwrap_or(false)
        }))
    }
}
