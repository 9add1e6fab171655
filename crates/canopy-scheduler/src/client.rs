//! Namespace writes issued by the scheduler

use std::sync::Arc;

use async_trait::async_trait;
use canopy_common::client::ClusterClients;
use canopy_common::{Error, LogicalCluster, FIELD_MANAGER, PLACEMENT_LABEL};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Patch, PatchParams};
use kube::Api;
use serde_json::json;

#[cfg(test)]
use mockall::automock;

/// Trait abstracting the namespace writes of the scheduler
///
/// The real implementation patches the API server; tests use the generated
/// `MockNamespaceClient`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespaceClient: Send + Sync {
    /// Set or clear the placement label of a namespace
    ///
    /// `target == None` removes the label, leaving the namespace unscheduled.
    async fn set_placement(
        &self,
        cluster: &LogicalCluster,
        namespace: &str,
        target: Option<String>,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct NamespaceClientImpl {
    clients: Arc<ClusterClients>,
}

impl NamespaceClientImpl {
    /// Create a new client writing through `clients`
    pub fn new(clients: Arc<ClusterClients>) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl NamespaceClient for NamespaceClientImpl {
    async fn set_placement(
        &self,
        cluster: &LogicalCluster,
        namespace: &str,
        target: Option<String>,
    ) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.clients.for_cluster(cluster)?);
        let patch = json!({
            "metadata": {
                "labels": { PLACEMENT_LABEL: target }
            }
        });
        api.patch(
            namespace,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}
