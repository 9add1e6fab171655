//! Virtual workspace server
//!
//! Serves three surfaces over one TLS listener:
//!
//! - `<root>/<org>/<scope>/apis/tenancy.canopy.dev/v1alpha1/workspaces[/<name>]`
//!   lists, gets and watches the workspaces visible to the caller;
//! - `<initializing>/<token>/...` lists and watches workspaces waiting for an
//!   initializer, accepts its status patch, and passes content requests
//!   through the content gate;
//! - `/clusters/<workspace>/...` passes member content requests through the
//!   content gate.
//!
//! TLS termination and shutdown are left to the caller.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use canopy_common::crd::Workspace;
use canopy_common::{LogicalCluster, TENANCY_GROUP};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::access::ScopedAccess;
use crate::content::{read_body, Accessor, ContentGate, ForwardRequest};
use crate::error::{Error, Result};
use crate::initializing::InitializingView;
use crate::scope::parse_scoped_path;
use crate::user::UserInfo;
use crate::watch::WatchEvent;

const WORKSPACE_VERSION: &str = "v1alpha1";

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Workspaces view
    pub access: Arc<ScopedAccess>,
    /// Initializing-workspaces view
    pub initializing: Arc<InitializingView>,
    /// Workspace content gate
    pub content: Arc<ContentGate>,
    /// Path prefix of the workspaces view
    pub root_path: String,
    /// Path prefix of the initializing-workspaces view
    pub initializing_path: String,
}

/// List and watch query parameters
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    watch: Option<String>,
    resource_version: Option<String>,
}

impl ListParams {
    fn is_watch(&self) -> bool {
        matches!(self.watch.as_deref(), Some("true" | "1"))
    }

    /// Resuming watches skip the synthetic ADDED events
    fn initial_events(&self) -> bool {
        matches!(self.resource_version.as_deref(), None | Some("") | Some("0"))
    }
}

/// Build the router
pub fn router(state: AppState) -> Router {
    let root = state.root_path.trim_end_matches('/').to_string();
    let initializing = state.initializing_path.trim_end_matches('/').to_string();

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz_handler))
        .route(&format!("{root}/{{*path}}"), get(workspaces_handler))
        .route(
            &format!("{initializing}/{{token}}/{{*rest}}"),
            any(initializing_handler),
        )
        .route("/clusters/{cluster}/{*path}", any(member_content_handler))
        .with_state(state)
}

async fn readyz_handler(State(state): State<AppState>) -> Result<&'static str> {
    let registry = state.access.registry();
    if !registry.shared().workspaces.has_synced() {
        return Err(Error::NotReady("workspace informer".to_string()));
    }
    if !registry.root().authz.is_ready() {
        return Err(Error::NotReady("authorization cache root".to_string()));
    }
    Ok("ok")
}

async fn workspaces_handler(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response> {
    let user = UserInfo::from_headers(&headers)?;
    let path = parse_scoped_path(&state.root_path, uri.path())?;

    let segments: Vec<&str> = path.rest.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["apis", TENANCY_GROUP, WORKSPACE_VERSION, "workspaces"] if params.is_watch() => {
            let rx = state.access.watch(&user, &path, params.initial_events())?;
            Ok(watch_response(rx))
        }
        ["apis", TENANCY_GROUP, WORKSPACE_VERSION, "workspaces"] => {
            let items = state.access.list(&user, &path)?;
            Ok(list_response(&items))
        }
        ["apis", TENANCY_GROUP, WORKSPACE_VERSION, "workspaces", name] => {
            let ws = state.access.get(&user, &path, name)?;
            Ok(Json(ws.as_ref()).into_response())
        }
        _ => Err(not_found(uri.path())),
    }
}

async fn initializing_handler(
    State(state): State<AppState>,
    Path((token, rest)): Path<(String, String)>,
    Query(params): Query<ListParams>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
    body: Body,
) -> Result<Response> {
    let user = UserInfo::from_headers(&headers)?;
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

    match (&method, segments.as_slice()) {
        (&Method::GET, ["apis", TENANCY_GROUP, WORKSPACE_VERSION, "workspaces"]) if params.is_watch() => {
            let rx = state
                .initializing
                .watch(&user, &token, params.initial_events())?;
            Ok(watch_response(rx))
        }
        (&Method::GET, ["apis", TENANCY_GROUP, WORKSPACE_VERSION, "workspaces"]) => {
            let items = state.initializing.list(&user, &token)?;
            Ok(list_response(&items))
        }
        (
            &Method::PATCH,
            ["clusters", cluster, "apis", TENANCY_GROUP, WORKSPACE_VERSION, "workspaces", name, "status"],
        ) => {
            require_merge_patch(&headers)?;
            let raw = read_body(body).await?;
            let patch: serde_json::Value = serde_json::from_slice(&raw)
                .map_err(|e| Error::Invalid(format!("patch is not valid JSON: {e}")))?;
            let updated = state
                .initializing
                .patch_status(&user, &token, &LogicalCluster::new(*cluster), name, &patch)
                .await?;
            Ok(Json(updated).into_response())
        }
        (_, ["clusters", cluster, tail @ ..]) => {
            let content = LogicalCluster::new(*cluster);
            let request = forward_request(method.clone(), tail, &uri, &headers, body, user).await?;
            state
                .content
                .serve(Accessor::Initializer(&token), &content, request)
                .await
        }
        _ => Err(not_found(uri.path())),
    }
}

async fn member_content_handler(
    State(state): State<AppState>,
    Path((cluster, path)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
    body: Body,
) -> Result<Response> {
    let user = UserInfo::from_headers(&headers)?;
    let tail: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let request = forward_request(method, &tail, &uri, &headers, body, user).await?;
    state
        .content
        .serve(Accessor::Member, &LogicalCluster::new(cluster), request)
        .await
}

async fn forward_request(
    method: Method,
    tail: &[&str],
    uri: &Uri,
    headers: &HeaderMap,
    body: Body,
    user: UserInfo,
) -> Result<ForwardRequest> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    debug!(user = %user.name, method = %method, path = %uri.path(), "Content request");
    Ok(ForwardRequest {
        method,
        path: format!("/{}", tail.join("/")),
        query: uri.query().map(str::to_string),
        content_type,
        body: read_body(body).await?,
        user,
    })
}

fn require_merge_patch(headers: &HeaderMap) -> Result<()> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if is_merge_patch(content_type) {
        Ok(())
    } else {
        Err(Error::Invalid(format!(
            "unsupported patch type {content_type:?}, use application/merge-patch+json"
        )))
    }
}

/// Media type without parameters is a merge patch or plain JSON
fn is_merge_patch(content_type: &str) -> bool {
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    media_type.eq_ignore_ascii_case("application/merge-patch+json")
        || media_type.eq_ignore_ascii_case("application/json")
}

fn list_response(items: &[Arc<Workspace>]) -> Response {
    let items: Vec<&Workspace> = items.iter().map(Arc::as_ref).collect();
    Json(serde_json::json!({
        "kind": "WorkspaceList",
        "apiVersion": format!("{TENANCY_GROUP}/{WORKSPACE_VERSION}"),
        "metadata": {},
        "items": items,
    }))
    .into_response()
}

/// Newline-delimited watch events, open until the watcher is terminated
fn watch_response(rx: mpsc::Receiver<WatchEvent>) -> Response {
    let stream = ReceiverStream::new(rx).map(|event| {
        serde_json::to_vec(&event.to_json()).map(|mut line| {
            line.push(b'\n');
            Bytes::from(line)
        })
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(stream),
    )
        .into_response()
}

fn not_found(path: &str) -> Error {
    Error::NotFound {
        kind: "path".to_string(),
        name: path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MockContentForwarder;
    use crate::initializing::MockWorkspaceStatusWriter;
    use crate::org_listener::{OrgRegistry, SharedCaches};
    use crate::rbac::testing::{binding, content_role, initializer_role};
    use crate::rbac::RbacEvaluator;
    use crate::scope::{AllScopePolicy, DEFAULT_ROOT_PATH};
    use crate::initializing::DEFAULT_INITIALIZING_PATH;
    use crate::user::USER_HEADER;
    use axum::http::Request;
    use canopy_common::crd::{WorkspacePhase, WorkspaceSpec, WorkspaceStatus};
    use canopy_common::LOGICAL_CLUSTER_ANNOTATION;
    use kube::ResourceExt;
    use rstest::rstest;
    use tower::ServiceExt;

    #[rstest]
    #[case::merge_patch("application/merge-patch+json", true)]
    #[case::plain_json("application/json", true)]
    #[case::with_charset("application/merge-patch+json; charset=utf-8", true)]
    #[case::json_patch("application/json-patch+json", false)]
    #[case::apply_patch("application/apply-patch+yaml", false)]
    #[case::strategic("application/strategic-merge-patch+json", false)]
    #[case::missing("", false)]
    fn merge_patch_media_types(#[case] content_type: &str, #[case] accepted: bool) {
        assert_eq!(is_merge_patch(content_type), accepted);
    }

    struct Fixture {
        shared: SharedCaches,
        registry: Arc<OrgRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let shared = SharedCaches::new();
            let rbac = Arc::new(RbacEvaluator::new(
                shared.roles.clone(),
                shared.bindings.clone(),
            ));
            let registry = OrgRegistry::new(shared.clone(), rbac);
            Self { shared, registry }
        }

        fn sync(&self) {
            self.shared.workspaces.replace_all(Vec::new());
            self.shared.roles.replace_all(Vec::new());
            self.shared.bindings.replace_all(Vec::new());
        }

        fn workspace(&self, cluster: &str, name: &str, phase: WorkspacePhase) {
            let mut ws = Workspace::new(name, WorkspaceSpec::default());
            ws.annotations_mut()
                .insert(LOGICAL_CLUSTER_ANNOTATION.to_string(), cluster.to_string());
            ws.status = Some(WorkspaceStatus {
                phase,
                base_url: Some("https://shard-1.example".to_string()),
                ..Default::default()
            });
            let change = self.shared.workspaces.apply(ws);
            self.registry.on_workspace(&change);
        }

        fn grant(&self, cluster: &str, role: &str, verbs: &[&str], names: &[&str], subject: &str) {
            let r = self.shared.roles.apply(content_role(cluster, role, verbs, names));
            self.registry.on_cluster_role(&r);
            let b = self.shared.bindings.apply(binding(cluster, role, role, &[subject]));
            self.registry.on_cluster_role_binding(&b);
        }

        fn app(&self, forwarder: MockContentForwarder) -> Router {
            let evaluator = Arc::clone(self.registry.evaluator());
            let state = AppState {
                access: Arc::new(ScopedAccess::new(
                    self.registry.clone(),
                    AllScopePolicy::OrgMembership,
                )),
                initializing: Arc::new(InitializingView::new(
                    self.shared.workspaces.clone(),
                    Arc::clone(&evaluator),
                    Arc::new(MockWorkspaceStatusWriter::new()),
                )),
                content: Arc::new(ContentGate::new(
                    self.shared.workspaces.clone(),
                    evaluator,
                    Arc::new(forwarder),
                )),
                root_path: DEFAULT_ROOT_PATH.to_string(),
                initializing_path: DEFAULT_INITIALIZING_PATH.to_string(),
            };
            router(state)
        }
    }

    fn get(uri: &str, user: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const ACME_WORKSPACES: &str =
        "/services/workspaces/acme/personal/apis/tenancy.canopy.dev/v1alpha1/workspaces";

    #[tokio::test]
    async fn readyz_waits_for_informers() {
        let f = Fixture::new();
        let app = f.app(MockContentForwarder::new());

        let response = app.clone().oneshot(get("/readyz", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        f.sync();
        let response = app.oneshot(get("/readyz", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn healthz_is_always_ok() {
        let f = Fixture::new();
        let response = f
            .app(MockContentForwarder::new())
            .oneshot(get("/healthz", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_returns_visible_workspaces() {
        let f = Fixture::new();
        f.sync();
        f.workspace("root", "acme", WorkspacePhase::Ready);
        f.workspace("root:acme", "team", WorkspacePhase::Ready);
        f.workspace("root:acme", "secret", WorkspacePhase::Ready);
        f.grant("root:acme", "team-access", &["access"], &["team"], "user:alice");

        let response = f
            .app(MockContentForwarder::new())
            .oneshot(get(ACME_WORKSPACES, Some("alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["kind"], "WorkspaceList");
        let items = body["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["metadata"]["name"], "team");
    }

    #[tokio::test]
    async fn missing_scope_and_identity_are_rejected() {
        let f = Fixture::new();
        f.sync();
        let app = f.app(MockContentForwarder::new());

        let response = app
            .clone()
            .oneshot(get("/services/workspaces/acme", Some("alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["reason"], "NotFound");

        let response = app.oneshot(get(ACME_WORKSPACES, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn watch_streams_initial_events() {
        let f = Fixture::new();
        f.sync();
        f.workspace("root", "acme", WorkspacePhase::Ready);
        f.workspace("root:acme", "team", WorkspacePhase::Ready);
        f.grant("root:acme", "team-access", &["access"], &["team"], "user:alice");

        let uri = format!("{ACME_WORKSPACES}?watch=true");
        let response = f
            .app(MockContentForwarder::new())
            .oneshot(get(&uri, Some("alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut stream = response.into_body().into_data_stream();
        let line = stream.next().await.unwrap().unwrap();
        let event: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(event["type"], "ADDED");
        assert_eq!(event["object"]["metadata"]["name"], "team");
    }

    #[tokio::test]
    async fn initializing_view_denies_ungranted_initializers() {
        let f = Fixture::new();
        f.sync();
        let response = f
            .app(MockContentForwarder::new())
            .oneshot(get(
                "/services/initializingworkspaces/alpha/apis/tenancy.canopy.dev/v1alpha1/workspaces",
                Some("eve"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn initializer_status_patch_requires_merge_patch() {
        let f = Fixture::new();
        f.sync();
        let r = f.shared.roles.apply(initializer_role("alpha", "alpha"));
        f.registry.on_cluster_role(&r);
        let b = f
            .shared
            .bindings
            .apply(binding("root", "alpha", "alpha", &["user:alpha-bot"]));
        f.registry.on_cluster_role_binding(&b);

        let request = Request::builder()
            .method(Method::PATCH)
            .uri("/services/initializingworkspaces/alpha/clusters/root:acme/apis/tenancy.canopy.dev/v1alpha1/workspaces/team/status")
            .header(USER_HEADER, "alpha-bot")
            .header(header::CONTENT_TYPE, "application/json-patch+json")
            .body(Body::from("[]"))
            .unwrap();
        let response = f
            .app(MockContentForwarder::new())
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn member_content_is_forwarded_once_ready() {
        let f = Fixture::new();
        f.sync();
        f.workspace("root:acme", "team", WorkspacePhase::Ready);
        f.grant("root:acme", "members", &["member"], &["team"], "user:alice");

        let mut forwarder = MockContentForwarder::new();
        forwarder
            .expect_forward()
            .withf(|base, req| {
                base == "https://shard-1.example"
                    && req.path == "/api/v1/configmaps"
                    && req.query.as_deref() == Some("limit=5")
            })
            .times(1)
            .returning(|_, _| Ok(Response::new(Body::from("{}"))));

        let response = f
            .app(forwarder)
            .oneshot(get(
                "/clusters/root:acme:team/api/v1/configmaps?limit=5",
                Some("alice"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
