//! Wiring for each subcommand
//!
//! Every `run_*` function starts its informers and servers under one
//! cancellation token and returns once the token fires and all of them
//! have stopped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use canopy_authz::content::ReqwestForwarder;
use canopy_authz::{
    AppState, ContentGate, InitializingView, OrgRegistry, RbacEvaluator, ScopedAccess,
    SharedCaches, WorkspaceStatusWriterImpl,
};
use canopy_common::cache::{Change, ScopedCache};
use canopy_common::client::ClusterClients;
use canopy_common::crd::{WorkloadCluster, Workspace};
use canopy_common::informer::Informer;
use canopy_scheduler::{Context, NamespaceClientImpl, NamespaceScheduler};
use futures::future::join_all;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cli::{SchedulerArgs, VirtualWorkspacesArgs, WebhookArgs};

/// TLS listener settings
struct ServerConfig {
    addr: SocketAddr,
    cert_pem: String,
    key_pem: String,
}

/// Every CRD owned by Canopy
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![Workspace::crd(), WorkloadCluster::crd()]
}

/// Install the CRDs with server-side apply
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(canopy_common::FIELD_MANAGER).force();

    for crd in crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        info!(crd = %name, "Installing CRD");
        api.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .with_context(|| format!("failed to install CRD {name}"))?;
    }
    Ok(())
}

fn spawn_informer<K>(
    informer: Informer<K>,
    token: &CancellationToken,
) -> JoinHandle<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
{
    tokio::spawn(informer.run(token.clone()))
}

/// Run the namespace scheduler until `token` fires
pub async fn run_scheduler(
    clients: Arc<ClusterClients>,
    args: SchedulerArgs,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let client = clients.wildcard()?;
    if args.install_crds {
        ensure_crds_installed(&client).await?;
    }

    let namespaces = Arc::new(ScopedCache::<Namespace>::new("Namespace"));
    let clusters = Arc::new(ScopedCache::<WorkloadCluster>::new("WorkloadCluster"));
    let workspaces = Arc::new(ScopedCache::<Workspace>::new("Workspace"));

    let ctx = Context::builder(Arc::new(NamespaceClientImpl::new(Arc::clone(&clients))))
        .namespaces(Arc::clone(&namespaces))
        .clusters(Arc::clone(&clusters))
        .workspaces(Arc::clone(&workspaces))
        .build();
    let scheduler = NamespaceScheduler::new(Arc::new(ctx), args.rate_limiter());

    let informers = vec![
        spawn_informer(
            Informer::new(Api::all(client.clone()), namespaces)
                .with_handler(scheduler.namespace_handler()),
            &token,
        ),
        spawn_informer(
            Informer::new(Api::all(client.clone()), clusters)
                .with_handler(scheduler.cluster_handler()),
            &token,
        ),
        spawn_informer(
            Informer::new(Api::all(client), workspaces)
                .with_handler(scheduler.workspace_handler()),
            &token,
        ),
    ];

    info!(workers = args.workers, "Starting namespace scheduler");
    scheduler.run(args.workers, token).await;
    join_all(informers).await;
    Ok(())
}

/// Serve the admission webhook until `token` fires
pub async fn run_webhook(args: WebhookArgs, token: CancellationToken) -> anyhow::Result<()> {
    let (cert_pem, key_pem) = args.tls.read().context("failed to read TLS files")?;
    info!(addr = %args.bind, "Starting admission webhook");
    serve_tls(
        canopy_admission::router(),
        ServerConfig {
            addr: args.bind,
            cert_pem,
            key_pem,
        },
        token,
    )
    .await
}

/// Serve the virtual workspaces until `token` fires
pub async fn run_virtual_workspaces(
    clients: Arc<ClusterClients>,
    args: VirtualWorkspacesArgs,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let (cert_pem, key_pem) = args.tls.read().context("failed to read TLS files")?;
    let client = clients.wildcard()?;

    // Namespaced RBAC never grants workspace access but gates readiness
    let roles_ns = Arc::new(ScopedCache::<Role>::new("Role"));
    let bindings_ns = Arc::new(ScopedCache::<RoleBinding>::new("RoleBinding"));
    let mut shared = SharedCaches::new();
    shared.readiness.push({
        let roles_ns = Arc::clone(&roles_ns);
        Arc::new(move || roles_ns.has_synced())
    });
    shared.readiness.push({
        let bindings_ns = Arc::clone(&bindings_ns);
        Arc::new(move || bindings_ns.has_synced())
    });

    let evaluator = Arc::new(RbacEvaluator::new(
        Arc::clone(&shared.roles),
        Arc::clone(&shared.bindings),
    ));
    let registry = OrgRegistry::new(shared.clone(), evaluator.clone());

    let initializing = Arc::new(InitializingView::new(
        Arc::clone(&shared.workspaces),
        evaluator.clone(),
        Arc::new(WorkspaceStatusWriterImpl::new(Arc::clone(&clients))),
    ));
    let forwarder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(args.forward_connect_timeout_secs))
        .build()
        .context("failed to build content forwarding client")?;
    let content = Arc::new(ContentGate::new(
        Arc::clone(&shared.workspaces),
        evaluator,
        Arc::new(ReqwestForwarder::new(forwarder)),
    ));

    let initializing_hub = Arc::clone(initializing.hub());
    let mut tasks = vec![
        spawn_informer(
            Informer::new(Api::<Workspace>::all(client.clone()), Arc::clone(&shared.workspaces))
                .with_handler(registry.workspace_handler())
                .with_handler(Arc::new(move |change: &Change<Workspace>| {
                    initializing_hub.on_workspace(change)
                })),
            &token,
        ),
        spawn_informer(
            Informer::new(Api::<ClusterRole>::all(client.clone()), Arc::clone(&shared.roles))
                .with_handler(registry.cluster_role_handler()),
            &token,
        ),
        spawn_informer(
            Informer::new(
                Api::<ClusterRoleBinding>::all(client.clone()),
                Arc::clone(&shared.bindings),
            )
            .with_handler(registry.cluster_role_binding_handler()),
            &token,
        ),
        spawn_informer(
            Informer::new(Api::<Role>::all(client.clone()), roles_ns)
                .with_handler(registry.namespaced_rbac_handler()),
            &token,
        ),
        spawn_informer(
            Informer::new(Api::<RoleBinding>::all(client), bindings_ns)
                .with_handler(registry.namespaced_rbac_handler()),
            &token,
        ),
    ];
    tasks.push(tokio::spawn(Arc::clone(&registry).run(token.clone())));

    let state = AppState {
        access: Arc::new(ScopedAccess::new(registry, args.all_scope_policy)),
        initializing,
        content,
        root_path: args.root_path,
        initializing_path: args.initializing_path,
    };
    info!(addr = %args.bind, policy = ?args.all_scope_policy, "Starting virtual workspace server");
    let served = serve_tls(
        canopy_authz::router(state),
        ServerConfig {
            addr: args.bind,
            cert_pem,
            key_pem,
        },
        token.clone(),
    )
    .await;

    token.cancel();
    join_all(tasks).await;
    served
}

async fn serve_tls(app: Router, config: ServerConfig, token: CancellationToken) -> anyhow::Result<()> {
    let tls = RustlsConfig::from_pem(config.cert_pem.into_bytes(), config.key_pem.into_bytes())
        .await
        .context("invalid TLS configuration")?;

    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        token.cancelled().await;
        shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    axum_server::bind_rustls(config.addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .inspect_err(|e| error!(error = %e, "Server failed"))
        .context("server error")
}
