//! Error types for the virtual workspace server

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for authorization and access operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for authorization and access operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No user identity on the request
    #[error("authentication required: {0}")]
    Unauthorized(String),

    /// Caller lacks the permission for this request
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Request path lacks a valid `<org>/<personal|all>` scope
    #[error("a scope of personal or all is required: {0}")]
    ScopeRequired(String),

    /// Object absent or invisible to the caller
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Object name
        name: String,
    },

    /// Authorization cache has not finished its initial sync
    #[error("{0} is not ready yet")]
    NotReady(String),

    /// Request body rejected
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Content request could not be forwarded
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Not-found error for a workspace
    pub fn workspace_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "workspaces".to_string(),
            name: name.into(),
        }
    }

    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::ScopeRequired(_) | Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Proxy(_) => StatusCode::BAD_GATEWAY,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Kubernetes `Status.reason`
    fn reason(&self) -> &'static str {
        match self {
            Error::Unauthorized(_) => "Unauthorized",
            Error::Forbidden(_) => "Forbidden",
            Error::ScopeRequired(_) | Error::NotFound { .. } => "NotFound",
            Error::NotReady(_) => "ServiceUnavailable",
            Error::Invalid(_) => "Invalid",
            Error::Proxy(_) | Error::Internal(_) => "InternalError",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // K8s-style Status body so kubectl and client-go classify the error
        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": self.to_string(),
            "reason": self.reason(),
            "code": status.as_u16()
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<canopy_common::Error> for Error {
    fn from(e: canopy_common::Error) -> Self {
        match e {
            canopy_common::Error::NotReady { component } => Error::NotReady(component),
            canopy_common::Error::NotFound { kind, key } => Error::NotFound { kind, name: key },
            canopy_common::Error::PolicyViolation { message, .. }
            | canopy_common::Error::Validation { message, .. } => Error::Invalid(message),
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Proxy(e.to_string())
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) if resp.code == 404 => Error::NotFound {
                kind: "workspaces".to_string(),
                name: resp.message,
            },
            kube::Error::Api(resp) if resp.code == 422 => Error::Invalid(resp.message),
            other => Error::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn errors_render_as_kubernetes_status() {
        let response = Error::ScopeRequired("/services/workspaces/acme".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .expect("body");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["kind"], "Status");
        assert_eq!(body["reason"], "NotFound");
        assert_eq!(body["code"], 404);
    }

    #[test]
    fn not_ready_is_distinct_from_empty() {
        let err: Error = canopy_common::Error::not_ready("authorization cache root:acme").into();
        assert!(matches!(err, Error::NotReady(_)));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn invalid_maps_to_unprocessable() {
        assert_eq!(
            Error::Invalid("only removal".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
