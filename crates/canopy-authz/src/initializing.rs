//! Initializing-workspaces view
//!
//! Each initializer gets a view under `/services/initializingworkspaces/<token>`
//! listing the workspaces that are `Initializing` and still wait for that
//! token. Membership is decided from the derived labels alone, never from
//! decoded status. A workspace that stops waiting for the token, or changes
//! phase, leaves the view as a DELETED event.
//!
//! Through the view an initializer may patch a workspace's status, but only
//! to remove its own token from `status.initializers`.

use std::sync::Arc;

use async_trait::async_trait;
use canopy_admission::initializer_label_key;
use canopy_common::cache::ScopedCache;
use canopy_common::client::ClusterClients;
use canopy_common::crd::{Workspace, WorkspacePhase};
use canopy_common::{ClusterAwareKey, LogicalCluster, FIELD_MANAGER, WORKSPACE_PHASE_LABEL};
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::rbac::{Attributes, PolicyEvaluator};
use crate::user::UserInfo;
use crate::watch::{WatchEvent, WatchHub};

#[cfg(test)]
use mockall::automock;

/// Default prefix of the initializing-workspaces view
pub const DEFAULT_INITIALIZING_PATH: &str = "/services/initializingworkspaces";

/// Workspace status writes issued on behalf of initializers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkspaceStatusWriter: Send + Sync {
    /// Apply a merge patch to the status subresource
    async fn patch_status(
        &self,
        cluster: &LogicalCluster,
        name: &str,
        patch: Value,
    ) -> std::result::Result<Workspace, canopy_common::Error>;
}

/// Real Kubernetes implementation
pub struct WorkspaceStatusWriterImpl {
    clients: Arc<ClusterClients>,
}

impl WorkspaceStatusWriterImpl {
    /// Write through `clients`
    pub fn new(clients: Arc<ClusterClients>) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl WorkspaceStatusWriter for WorkspaceStatusWriterImpl {
    async fn patch_status(
        &self,
        cluster: &LogicalCluster,
        name: &str,
        patch: Value,
    ) -> std::result::Result<Workspace, canopy_common::Error> {
        let api: Api<Workspace> = Api::all(self.clients.for_cluster(cluster)?);
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(api.patch_status(name, &params, &Patch::Merge(&patch)).await?)
    }
}

/// True if `ws` belongs in the view of `token`
///
/// `label` is the token's initializer label key.
pub fn in_view(ws: &Workspace, label: &str) -> bool {
    let labels = ws.labels();
    labels
        .get(WORKSPACE_PHASE_LABEL)
        .is_some_and(|phase| phase == &WorkspacePhase::Initializing.to_string())
        && labels.contains_key(label)
}

/// Accept a patched status only if it removes `token` and nothing else
pub fn check_initializer_patch(current: &Workspace, patched: &Workspace, token: &str) -> Result<()> {
    let mut expected = current.status.clone().unwrap_or_default();
    expected.initializers.retain(|t| t != token);
    let patched_status = patched.status.clone().unwrap_or_default();

    let expected = serde_json::to_value(&expected).map_err(|e| Error::Internal(e.to_string()))?;
    let actual =
        serde_json::to_value(&patched_status).map_err(|e| Error::Internal(e.to_string()))?;
    if expected != actual {
        return Err(Error::Invalid(format!(
            "initializer {token:?} may only remove itself from status.initializers"
        )));
    }
    Ok(())
}

/// The initializing-workspaces view
pub struct InitializingView {
    workspaces: Arc<ScopedCache<Workspace>>,
    evaluator: Arc<dyn PolicyEvaluator>,
    writer: Arc<dyn WorkspaceStatusWriter>,
    hub: Arc<WatchHub>,
}

impl InitializingView {
    /// View over every logical cluster's workspaces
    pub fn new(
        workspaces: Arc<ScopedCache<Workspace>>,
        evaluator: Arc<dyn PolicyEvaluator>,
        writer: Arc<dyn WorkspaceStatusWriter>,
    ) -> Self {
        let hub = Arc::new(WatchHub::new(
            "initializingworkspaces",
            Arc::clone(&workspaces),
            None,
        ));
        Self {
            workspaces,
            evaluator,
            writer,
            hub,
        }
    }

    /// Hub to feed with workspace changes
    pub fn hub(&self) -> &Arc<WatchHub> {
        &self.hub
    }

    /// Workspaces waiting for `token`, ordered by key
    pub fn list(&self, user: &UserInfo, token: &str) -> Result<Vec<Arc<Workspace>>> {
        let label = self.authorize(user, token)?;
        self.ensure_synced()?;
        let mut items = self
            .workspaces
            .list_filtered(|_, ws| in_view(ws, &label));
        items.sort_by_key(|ws| ClusterAwareKey::from_object(ws.as_ref()));
        Ok(items)
    }

    /// Watch the workspaces waiting for `token`
    pub fn watch(
        &self,
        user: &UserInfo,
        token: &str,
        initial_events: bool,
    ) -> Result<mpsc::Receiver<WatchEvent>> {
        let label = self.authorize(user, token)?;
        self.ensure_synced()?;
        Ok(self
            .hub
            .watch(Arc::new(move |ws: &Workspace| in_view(ws, &label)), initial_events))
    }

    /// Apply an initializer's status merge patch
    pub async fn patch_status(
        &self,
        user: &UserInfo,
        token: &str,
        cluster: &LogicalCluster,
        name: &str,
        patch: &Value,
    ) -> Result<Workspace> {
        let label = self.authorize(user, token)?;
        let key = ClusterAwareKey::new(cluster.clone(), name);
        let current = self
            .workspaces
            .get(&key)
            .filter(|ws| in_view(ws, &label))
            .ok_or_else(|| Error::workspace_not_found(name))?;

        let mut doc = serde_json::to_value(current.as_ref()).map_err(|e| Error::Internal(e.to_string()))?;
        json_patch::merge(&mut doc, patch);
        let patched: Workspace = serde_json::from_value(doc)
            .map_err(|e| Error::Invalid(format!("patched workspace does not decode: {e}")))?;
        check_initializer_patch(&current, &patched, token)?;

        let initializers = patched
            .status
            .as_ref()
            .map(|s| s.initializers.clone())
            .unwrap_or_default();
        let write = json!({
            "metadata": { "resourceVersion": current.resource_version() },
            "status": { "initializers": initializers },
        });
        let updated = self.writer.patch_status(cluster, name, write).await?;
        info!(
            user = %user.name,
            initializer = %token,
            workspace = %key,
            "Initializer removed itself"
        );
        Ok(updated)
    }

    /// Label key of `token` if `user` may act as that initializer
    fn authorize(&self, user: &UserInfo, token: &str) -> Result<String> {
        let label = initializer_label_key(token).map_err(|e| Error::Invalid(e.to_string()))?;
        let root = LogicalCluster::root();
        if !self
            .evaluator
            .allows(&root, user, &Attributes::initializer(token))
        {
            debug!(user = %user.name, initializer = %token, "Initializer access denied");
            return Err(Error::Forbidden(format!(
                "user {:?} cannot initialize workspaces for {token:?}",
                user.name
            )));
        }
        Ok(label)
    }

    fn ensure_synced(&self) -> Result<()> {
        if self.workspaces.has_synced() {
            Ok(())
        } else {
            Err(Error::NotReady("workspace informer".to_string()))
        }
    }
}
