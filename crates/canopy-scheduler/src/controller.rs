//! Namespace scheduling controller
//!
//! Three work queues, one per watched kind, feed three worker pools:
//!
//! - **namespace**: place the namespace on a schedulable WorkloadCluster of
//!   its logical cluster, keep a still-valid placement, or clear the
//!   placement label when nothing is schedulable.
//! - **cluster**: a removed cluster re-enqueues every namespace of its
//!   logical cluster; a cordoned or unhealthy one re-enqueues the namespaces
//!   placed on it; a schedulable one picks up unplaced namespaces and asks
//!   the [`RebalancePolicy`] whether anything should move onto it.
//! - **workspace**: re-enqueue every namespace in the workspace's content
//!   cluster so workspace-level state (the unschedulable annotation) applies.
//!
//! All passes read from the informer caches and are idempotent, so a key can
//! be dropped, retried or replayed after a restart without harm.

use std::sync::Arc;

use canopy_common::cache::{Change, ScopedCache};
use canopy_common::crd::{WorkloadCluster, Workspace};
use canopy_common::informer::ChangeHandler;
use canopy_common::metrics::{ReconcileTimer, NAMESPACE_PLACEMENTS};
use canopy_common::{ClusterAwareKey, Error, LogicalCluster, Result, PLACEMENT_LABEL};
use futures::future::join_all;
use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use opentelemetry::KeyValue;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::client::NamespaceClient;
use crate::queue::{RateLimiterConfig, WorkQueue};

/// System namespaces that are never scheduled
pub const NAMESPACE_BLOCKLIST: &[&str] = &["kube-system", "kube-public", "kube-node-lease"];

/// True for namespaces the scheduler must never touch
pub fn is_blocklisted(name: &str) -> bool {
    NAMESPACE_BLOCKLIST.contains(&name)
}

/// The three item types the scheduler reconciles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Tenant namespaces
    Namespace,
    /// WorkloadClusters
    Cluster,
    /// Workspaces
    Workspace,
}

impl QueueKind {
    /// Queue name used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Namespace => "namespace",
            Self::Cluster => "cluster",
            Self::Workspace => "workspace",
        }
    }

    const ALL: [QueueKind; 3] = [Self::Namespace, Self::Cluster, Self::Workspace];
}

/// Outcome of a namespace placement decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Label is already correct
    Keep,
    /// Label the namespace with this cluster
    Place(String),
    /// Remove the placement label
    Unplace,
}

/// Decide where a namespace should live
///
/// `schedulable` lists the schedulable clusters of the namespace's logical
/// cluster. A current placement on one of them is kept; otherwise a random
/// one is chosen.
pub fn decide_placement<R: Rng + ?Sized>(
    current: Option<&str>,
    schedulable: &[String],
    workspace_unschedulable: bool,
    rng: &mut R,
) -> Placement {
    if workspace_unschedulable {
        return match current {
            Some(_) => Placement::Unplace,
            None => Placement::Keep,
        };
    }
    if let Some(current) = current {
        if schedulable.iter().any(|c| c == current) {
            return Placement::Keep;
        }
    }
    match schedulable.choose(rng) {
        Some(target) => Placement::Place(target.clone()),
        None if current.is_some() => Placement::Unplace,
        None => Placement::Keep,
    }
}

/// Hook deciding whether already-placed namespaces move to a cluster
///
/// Called when a cluster is (re)observed schedulable. Returns the names of
/// namespaces in `placed` that should be moved onto `target`.
pub trait RebalancePolicy: Send + Sync {
    /// Namespaces to move onto `target`
    fn namespaces_to_move(&self, target: &WorkloadCluster, placed: &[Arc<Namespace>])
        -> Vec<String>;
}

/// Never moves placed namespaces
pub struct NoRebalance;

impl RebalancePolicy for NoRebalance {
    fn namespaces_to_move(&self, _: &WorkloadCluster, _: &[Arc<Namespace>]) -> Vec<String> {
        Vec::new()
    }
}

/// Controller context: caches plus the write seam
pub struct Context {
    /// Namespace cache
    pub namespaces: Arc<ScopedCache<Namespace>>,
    /// WorkloadCluster cache
    pub clusters: Arc<ScopedCache<WorkloadCluster>>,
    /// Workspace cache
    pub workspaces: Arc<ScopedCache<Workspace>>,
    /// Namespace writes (trait object for testability)
    pub client: Arc<dyn NamespaceClient>,
    /// Rebalancing hook
    pub rebalance: Arc<dyn RebalancePolicy>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Arc<dyn NamespaceClient>) -> ContextBuilder {
        ContextBuilder {
            client,
            namespaces: None,
            clusters: None,
            workspaces: None,
            rebalance: None,
        }
    }

    /// Context with empty caches, for tests
    #[cfg(test)]
    pub fn for_testing(client: Arc<dyn NamespaceClient>) -> Self {
        Self::builder(client).build()
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Arc<dyn NamespaceClient>,
    namespaces: Option<Arc<ScopedCache<Namespace>>>,
    clusters: Option<Arc<ScopedCache<WorkloadCluster>>>,
    workspaces: Option<Arc<ScopedCache<Workspace>>>,
    rebalance: Option<Arc<dyn RebalancePolicy>>,
}

impl ContextBuilder {
    /// Use a shared namespace cache
    pub fn namespaces(mut self, cache: Arc<ScopedCache<Namespace>>) -> Self {
        self.namespaces = Some(cache);
        self
    }

    /// Use a shared WorkloadCluster cache
    pub fn clusters(mut self, cache: Arc<ScopedCache<WorkloadCluster>>) -> Self {
        self.clusters = Some(cache);
        self
    }

    /// Use a shared Workspace cache
    pub fn workspaces(mut self, cache: Arc<ScopedCache<Workspace>>) -> Self {
        self.workspaces = Some(cache);
        self
    }

    /// Override the rebalancing policy (default: [`NoRebalance`])
    pub fn rebalance(mut self, policy: Arc<dyn RebalancePolicy>) -> Self {
        self.rebalance = Some(policy);
        self
    }

    /// Build the context, creating empty caches where none were given
    pub fn build(self) -> Context {
        Context {
            namespaces: self
                .namespaces
                .unwrap_or_else(|| Arc::new(ScopedCache::new("Namespace"))),
            clusters: self
                .clusters
                .unwrap_or_else(|| Arc::new(ScopedCache::new("WorkloadCluster"))),
            workspaces: self
                .workspaces
                .unwrap_or_else(|| Arc::new(ScopedCache::new("Workspace"))),
            client: self.client,
            rebalance: self.rebalance.unwrap_or_else(|| Arc::new(NoRebalance)),
        }
    }
}

/// The namespace scheduler and its three queues
pub struct NamespaceScheduler {
    ctx: Arc<Context>,
    namespace_queue: Arc<WorkQueue<String>>,
    cluster_queue: Arc<WorkQueue<String>>,
    workspace_queue: Arc<WorkQueue<String>>,
}

impl NamespaceScheduler {
    /// Create a scheduler; every queue uses the same limiter settings
    pub fn new(ctx: Arc<Context>, limiter: RateLimiterConfig) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            namespace_queue: WorkQueue::new(QueueKind::Namespace.as_str(), limiter.clone()),
            cluster_queue: WorkQueue::new(QueueKind::Cluster.as_str(), limiter.clone()),
            workspace_queue: WorkQueue::new(QueueKind::Workspace.as_str(), limiter),
        })
    }

    /// Queue for one item kind
    pub fn queue(&self, kind: QueueKind) -> &Arc<WorkQueue<String>> {
        match kind {
            QueueKind::Namespace => &self.namespace_queue,
            QueueKind::Cluster => &self.cluster_queue,
            QueueKind::Workspace => &self.workspace_queue,
        }
    }

    /// Informer handler feeding the namespace queue
    ///
    /// Blocklisted namespaces are filtered here and never enqueued. Deletions
    /// need no placement work.
    pub fn namespace_handler(&self) -> ChangeHandler<Namespace> {
        let queue = Arc::clone(&self.namespace_queue);
        Arc::new(move |change: &Change<Namespace>| match change {
            Change::Added(ns) | Change::Updated { new: ns, .. } => enqueue_namespace(&queue, ns),
            Change::Deleted(_) => {}
        })
    }

    /// Informer handler feeding the cluster queue
    ///
    /// Deletions are enqueued too: the not-found pass reschedules orphans.
    pub fn cluster_handler(&self) -> ChangeHandler<WorkloadCluster> {
        let queue = Arc::clone(&self.cluster_queue);
        Arc::new(move |change: &Change<WorkloadCluster>| {
            queue.add(ClusterAwareKey::from_object(change.object().as_ref()).to_string());
        })
    }

    /// Informer handler feeding the workspace queue
    pub fn workspace_handler(&self) -> ChangeHandler<Workspace> {
        let queue = Arc::clone(&self.workspace_queue);
        Arc::new(move |change: &Change<Workspace>| match change {
            Change::Added(ws) | Change::Updated { new: ws, .. } => {
                queue.add(ClusterAwareKey::from_object(ws.as_ref()).to_string())
            }
            Change::Deleted(_) => {}
        })
    }

    /// Run `workers` workers per queue until `token` is cancelled
    ///
    /// On cancellation the queues stop accepting keys, workers finish the
    /// keys already queued, and this returns once every worker has exited.
    pub async fn run(self: Arc<Self>, workers: usize, token: CancellationToken) {
        let workers = workers.max(1);
        info!(workers, "Starting namespace scheduler");

        let mut tasks = Vec::with_capacity(workers * QueueKind::ALL.len());
        for kind in QueueKind::ALL {
            for _ in 0..workers {
                let this = Arc::clone(&self);
                tasks.push(tokio::spawn(async move { this.worker(kind).await }));
            }
        }

        token.cancelled().await;
        info!("Shutting down namespace scheduler");
        for kind in QueueKind::ALL {
            self.queue(kind).shutdown();
        }
        for joined in join_all(tasks).await {
            if let Err(e) = joined {
                error!(error = %e, "Scheduler worker panicked");
            }
        }
        info!("Namespace scheduler stopped");
    }

    async fn worker(&self, kind: QueueKind) {
        let queue = Arc::clone(self.queue(kind));
        while let Some(key) = queue.get().await {
            let timer = ReconcileTimer::start(kind.as_str());
            let result = self.process(kind, &key).await;
            handle_result(&queue, &key, result, timer);
            queue.done(&key);
        }
        debug!(queue = kind.as_str(), "Worker exiting");
    }

    /// Reconcile one key of the given kind
    pub async fn process(&self, kind: QueueKind, key: &str) -> Result<()> {
        match kind {
            QueueKind::Namespace => self.process_namespace(key).await,
            QueueKind::Cluster => self.process_cluster(key).await,
            QueueKind::Workspace => self.process_workspace(key).await,
        }
    }

    /// Place, keep or unplace one namespace
    #[instrument(skip(self), fields(queue = "namespace"))]
    pub async fn process_namespace(&self, key: &str) -> Result<()> {
        let key = ClusterAwareKey::parse(key)?;
        let Some(ns) = self.ctx.namespaces.get(&key) else {
            debug!("Namespace gone, nothing to do");
            return Ok(());
        };
        if is_blocklisted(&key.name) {
            return Ok(());
        }

        let current = ns.labels().get(PLACEMENT_LABEL).map(String::as_str);
        let schedulable = self.schedulable_clusters(&key.cluster);
        let placement = decide_placement(
            current,
            &schedulable,
            self.workspace_unschedulable(&key.cluster),
            &mut rand::thread_rng(),
        );

        let (action, target) = match placement {
            Placement::Keep => {
                NAMESPACE_PLACEMENTS.add(1, &[KeyValue::new("action", "kept")]);
                return Ok(());
            }
            Placement::Place(target) => ("placed", Some(target)),
            Placement::Unplace => ("unplaced", None),
        };

        info!(
            cluster = %key.cluster,
            namespace = %key.name,
            from = ?current,
            to = ?target,
            "Updating namespace placement"
        );
        match self
            .ctx
            .client
            .set_placement(&key.cluster, &key.name, target)
            .await
        {
            Ok(()) => {
                NAMESPACE_PLACEMENTS.add(1, &[KeyValue::new("action", action)]);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// React to a WorkloadCluster change
    #[instrument(skip(self), fields(queue = "cluster"))]
    pub async fn process_cluster(&self, key: &str) -> Result<()> {
        let key = ClusterAwareKey::parse(key)?;
        let Some(cluster) = self.ctx.clusters.get(&key) else {
            info!(cluster = %key, "WorkloadCluster removed, rescheduling its logical cluster");
            self.enqueue_namespaces(&key.cluster, |_| true);
            return Ok(());
        };

        if !cluster.is_schedulable() {
            debug!(cluster = %key, "WorkloadCluster not schedulable, moving its namespaces");
            self.enqueue_namespaces(&key.cluster, |ns| placement_of(ns) == Some(&key.name));
            return Ok(());
        }

        self.enqueue_namespaces(&key.cluster, |ns| placement_of(ns).is_none());

        let placed: Vec<Arc<Namespace>> = self
            .ctx
            .namespaces
            .list_cluster(&key.cluster)
            .into_iter()
            .filter(|ns| !is_blocklisted(&ns.name_any()))
            .filter(|ns| placement_of(ns).is_some_and(|c| *c != key.name))
            .collect();
        for name in self.ctx.rebalance.namespaces_to_move(&cluster, &placed) {
            info!(cluster = %key, namespace = %name, "Rebalancing namespace");
            match self
                .ctx
                .client
                .set_placement(&key.cluster, &name, Some(key.name.clone()))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Re-evaluate every namespace inside a workspace
    #[instrument(skip(self), fields(queue = "workspace"))]
    pub async fn process_workspace(&self, key: &str) -> Result<()> {
        let key = ClusterAwareKey::parse(key)?;
        let Some(ws) = self.ctx.workspaces.get(&key) else {
            return Ok(());
        };
        self.enqueue_namespaces(&ws.content_cluster(), |_| true);
        Ok(())
    }

    fn schedulable_clusters(&self, cluster: &LogicalCluster) -> Vec<String> {
        let mut names: Vec<String> = self
            .ctx
            .clusters
            .list_cluster(cluster)
            .into_iter()
            .filter(|c| c.is_schedulable())
            .map(|c| c.name_any())
            .collect();
        names.sort();
        names
    }

    /// Whether the workspace owning `cluster` forbids scheduling
    fn workspace_unschedulable(&self, cluster: &LogicalCluster) -> bool {
        let Some(parent) = cluster.parent() else {
            return false;
        };
        let key = ClusterAwareKey::new(parent, cluster.base());
        self.ctx
            .workspaces
            .get(&key)
            .is_some_and(|ws| ws.is_unschedulable())
    }

    fn enqueue_namespaces<F>(&self, cluster: &LogicalCluster, mut pred: F)
    where
        F: FnMut(&Namespace) -> bool,
    {
        for ns in self.ctx.namespaces.list_cluster(cluster) {
            if pred(&ns) {
                enqueue_namespace(&self.namespace_queue, &ns);
            }
        }
    }
}

fn placement_of(ns: &Namespace) -> Option<&String> {
    ns.labels().get(PLACEMENT_LABEL)
}

fn enqueue_namespace(queue: &WorkQueue<String>, ns: &Namespace) {
    let key = ClusterAwareKey::from_object(ns);
    if is_blocklisted(&key.name) {
        return;
    }
    queue.add(key.to_string());
}

/// Requeue, drop or forget a key after a pass
fn handle_result(
    queue: &Arc<WorkQueue<String>>,
    key: &str,
    result: Result<()>,
    timer: ReconcileTimer,
) {
    let key = key.to_string();
    match result {
        Ok(()) => {
            queue.forget(&key);
            timer.success();
        }
        Err(e) if e.is_retryable() => {
            warn!(
                queue = queue.name(),
                key = %key,
                retries = queue.num_requeues(&key),
                error = %e,
                "Reconcile failed, requeueing"
            );
            queue.add_rate_limited(key);
            timer.requeued();
        }
        Err(e) => {
            let reason = match &e {
                Error::MalformedKey { .. } => "malformed_key",
                _ => "permanent",
            };
            error!(queue = queue.name(), key = %key, error = %e, "Dropping key");
            queue.forget(&key);
            timer.dropped(reason);
        }
    }
}
