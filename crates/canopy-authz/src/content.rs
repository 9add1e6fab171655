//! Workspace content gate
//!
//! Requests for objects inside a workspace reach the workspace's shard only
//! through this gate:
//!
//! - an initializer may enter while the workspace is `Initializing` and
//!   still lists its token;
//! - a member (`member` on `workspaces/content`) may enter once it is `Ready`.
//!
//! Everything else is Forbidden. Allowed requests are forwarded to the
//! workspace `baseURL` impersonating the caller.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{Method, StatusCode};
use axum::response::Response;
use canopy_common::cache::ScopedCache;
use canopy_common::crd::{Workspace, WorkspacePhase};
use canopy_common::metrics::{Decision, CONTENT_DECISIONS};
use canopy_common::{ClusterAwareKey, LogicalCluster};
use futures::TryStreamExt;
use opentelemetry::KeyValue;
use tracing::debug;

use crate::error::{Error, Result};
use crate::rbac::{Attributes, PolicyEvaluator, MEMBER_VERB};
use crate::user::UserInfo;

#[cfg(test)]
use mockall::automock;

/// Maximum request body forwarded to a shard
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Who is asking to enter a workspace
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Accessor<'a> {
    /// An initializer acting for its token
    Initializer(&'a str),
    /// A workspace member
    Member,
}

impl Accessor<'_> {
    fn as_str(&self) -> &'static str {
        match self {
            Accessor::Initializer(_) => "initializer",
            Accessor::Member => "member",
        }
    }
}

/// True if the workspace's lifecycle state admits `accessor`
pub fn lifecycle_admits(ws: &Workspace, accessor: Accessor<'_>) -> bool {
    match accessor {
        Accessor::Initializer(token) => {
            ws.phase() == WorkspacePhase::Initializing && ws.initializers().contains(token)
        }
        Accessor::Member => ws.phase() == WorkspacePhase::Ready,
    }
}

/// A request to forward into a workspace
#[derive(Clone, Debug)]
pub struct ForwardRequest {
    /// HTTP method
    pub method: Method,
    /// Path below the workspace, starting with `/`
    pub path: String,
    /// Raw query string
    pub query: Option<String>,
    /// Content-Type of the body
    pub content_type: Option<String>,
    /// Request body
    pub body: Bytes,
    /// Caller to impersonate
    pub user: UserInfo,
}

impl ForwardRequest {
    /// True for watch and follow requests, which are streamed back
    pub fn is_streaming(&self) -> bool {
        self.query.as_deref().is_some_and(|q| {
            q.split('&')
                .any(|kv| matches!(kv, "watch=true" | "watch=1" | "follow=true" | "follow=1"))
        })
    }
}

/// Sends allowed requests to the workspace's shard
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContentForwarder: Send + Sync {
    /// Forward to `<base_url><path>`
    async fn forward(&self, base_url: &str, request: ForwardRequest) -> Result<Response<Body>>;
}

/// reqwest-backed forwarder
pub struct ReqwestForwarder {
    client: reqwest::Client,
}

impl ReqwestForwarder {
    /// Forward with `client`
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ContentForwarder for ReqwestForwarder {
    async fn forward(&self, base_url: &str, request: ForwardRequest) -> Result<Response<Body>> {
        let streaming = request.is_streaming();
        let url = match &request.query {
            Some(q) => format!("{}{}?{}", base_url.trim_end_matches('/'), request.path, q),
            None => format!("{}{}", base_url.trim_end_matches('/'), request.path),
        };
        debug!(method = %request.method, url = %url, "Forwarding workspace content request");

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header("Impersonate-User", &request.user.name);
        for group in &request.user.groups {
            builder = builder.header("Impersonate-Group", group);
        }
        if let Some(ct) = &request.content_type {
            builder = builder.header("Content-Type", ct);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.to_vec());
        }

        let response = builder.send().await?;
        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();

        let body = if streaming {
            Body::from_stream(response.bytes_stream().map_err(std::io::Error::other))
        } else {
            Body::from(response.bytes().await?)
        };
        Response::builder()
            .status(status)
            .header("Content-Type", content_type)
            .body(body)
            .map_err(|e| Error::Internal(format!("failed to build response: {e}")))
    }
}

/// Decides and forwards workspace content requests
pub struct ContentGate {
    workspaces: Arc<ScopedCache<Workspace>>,
    evaluator: Arc<dyn PolicyEvaluator>,
    forwarder: Arc<dyn ContentForwarder>,
}

impl ContentGate {
    /// Gate over the shared workspace cache
    pub fn new(
        workspaces: Arc<ScopedCache<Workspace>>,
        evaluator: Arc<dyn PolicyEvaluator>,
        forwarder: Arc<dyn ContentForwarder>,
    ) -> Self {
        Self {
            workspaces,
            evaluator,
            forwarder,
        }
    }

    /// Check `accessor` against the workspace owning `content`
    ///
    /// Returns the workspace's `baseURL` when allowed.
    pub fn authorize(
        &self,
        user: &UserInfo,
        accessor: Accessor<'_>,
        content: &LogicalCluster,
    ) -> Result<String> {
        let decision = self.decide(user, accessor, content);
        let label = Decision::from(decision.is_ok());
        CONTENT_DECISIONS.add(
            1,
            &[
                KeyValue::new("decision", label.as_str()),
                KeyValue::new("via", accessor.as_str()),
            ],
        );
        decision
    }

    /// Authorize and forward
    pub async fn serve(
        &self,
        accessor: Accessor<'_>,
        content: &LogicalCluster,
        request: ForwardRequest,
    ) -> Result<Response<Body>> {
        let base_url = self.authorize(&request.user, accessor, content)?;
        self.forwarder.forward(&base_url, request).await
    }

    fn decide(&self, user: &UserInfo, accessor: Accessor<'_>, content: &LogicalCluster) -> Result<String> {
        let forbidden = || {
            Error::Forbidden(format!(
                "user {:?} cannot access workspace {content}",
                user.name
            ))
        };

        let parent = content.parent().ok_or_else(forbidden)?;
        let name = content.base();

        let granted = match accessor {
            Accessor::Initializer(token) => {
                self.evaluator
                    .allows(&LogicalCluster::root(), user, &Attributes::initializer(token))
            }
            Accessor::Member => self.evaluator.allows(
                &parent,
                user,
                &Attributes::workspace_content(MEMBER_VERB, name),
            ),
        };
        if !granted {
            return Err(forbidden());
        }

        let ws = self
            .workspaces
            .get(&ClusterAwareKey::new(parent, name))
            .ok_or_else(forbidden)?;
        if !lifecycle_admits(&ws, accessor) {
            debug!(
                user = %user.name,
                workspace = %content,
                phase = %ws.phase(),
                accessor = accessor.as_str(),
                "Workspace lifecycle does not admit caller"
            );
            return Err(forbidden());
        }
        ws.base_url()
            .map(str::to_string)
            .ok_or_else(|| Error::NotReady(format!("workspace {content} has no baseURL")))
    }
}

/// Read a request body up to the forwarding limit
pub async fn read_body(body: Body) -> Result<Bytes> {
    axum::body::to_bytes(body, MAX_BODY_SIZE)
        .await
        .map_err(|e| Error::Invalid(format!("failed to read request body: {e}")))
}
