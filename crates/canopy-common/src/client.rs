//! Kubernetes clients addressed by logical cluster
//!
//! In single-cluster mode every logical cluster is served by the same API
//! endpoint and one client is shared. In path-prefix mode each logical
//! cluster is reached under `<server>/clusters/<logical-cluster>`, and
//! cross-cluster watches use the `*` wildcard cluster.

use dashmap::DashMap;
use kube::{Client, Config};
use tracing::debug;

use crate::logicalcluster::LogicalCluster;
use crate::{Error, Result};

/// Wildcard cluster used for watches spanning every logical cluster
pub const WILDCARD_CLUSTER: &str = "*";

/// How logical clusters map onto API endpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClusterRouting {
    /// One API server, logical cluster carried only by annotation
    #[default]
    Single,
    /// `/clusters/<logical-cluster>` path prefix per logical cluster
    PathPrefix,
}

impl std::str::FromStr for ClusterRouting {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "path-prefix" => Ok(Self::PathPrefix),
            other => Err(format!(
                "unknown cluster routing {other:?} (expected single or path-prefix)"
            )),
        }
    }
}

/// Hands out clients per logical cluster, building each at most once
pub struct ClusterClients {
    base: Config,
    routing: ClusterRouting,
    shared: Client,
    per_cluster: DashMap<String, Client>,
}

impl ClusterClients {
    /// Build from a base kube config
    pub fn new(base: Config, routing: ClusterRouting) -> Result<Self> {
        let shared = Client::try_from(base.clone())?;
        Ok(Self {
            base,
            routing,
            shared,
            per_cluster: DashMap::new(),
        })
    }

    /// Client spanning every logical cluster (for informers)
    pub fn wildcard(&self) -> Result<Client> {
        self.client_at(WILDCARD_CLUSTER)
    }

    /// Client scoped to one logical cluster (for writes)
    pub fn for_cluster(&self, cluster: &LogicalCluster) -> Result<Client> {
        self.client_at(cluster.as_str())
    }

    fn client_at(&self, cluster: &str) -> Result<Client> {
        if self.routing == ClusterRouting::Single {
            return Ok(self.shared.clone());
        }
        if let Some(client) = self.per_cluster.get(cluster) {
            return Ok(client.clone());
        }

        let url = cluster_url(&self.base.cluster_url.to_string(), cluster);
        let mut config = self.base.clone();
        config.cluster_url = url
            .parse()
            .map_err(|e| Error::internal_with_context("client", format!("{url}: {e}")))?;
        let client = Client::try_from(config)?;
        debug!(cluster, url = %url, "Built logical cluster client");
        Ok(self
            .per_cluster
            .entry(cluster.to_string())
            .or_insert(client)
            .clone())
    }
}

fn cluster_url(base: &str, cluster: &str) -> String {
    format!("{}/clusters/{}", base.trim_end_matches('/'), cluster)
}
