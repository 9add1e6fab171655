//! Workspace admission webhook
//!
//! Serves `AdmissionReview` requests for Workspaces:
//!
//! - `POST /mutate/workspaces` runs [`admit`] and answers with a JSON patch
//!   replacing `/metadata/labels` (empty when labels are already in sync).
//! - `POST /validate/workspaces` runs [`validate`] and denies with the
//!   violation reason.
//!
//! Requests for any other kind are allowed unchanged.

use axum::{routing::get, routing::post, Json, Router};
use canopy_common::crd::Workspace;
use canopy_common::metrics::{record_admission, Decision};
use canopy_common::TENANCY_GROUP;
use json_patch::{AddOperation, PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::lifecycle::{admit, validate};

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The embedded object could not be decoded as a Workspace
    #[error("invalid workspace object: {0}")]
    InvalidObject(#[from] serde_json::Error),
}

/// Router serving the mutating and validating endpoints
pub fn router() -> Router {
    Router::new()
        .route("/mutate/workspaces", post(mutate_handler))
        .route("/validate/workspaces", post(validate_handler))
        .route("/healthz", get(|| async { "ok" }))
}

/// Handle a mutating admission review
pub async fn mutate_handler(
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    let response = mutate(&req);
    record_admission("mutate", Decision::from(response.allowed));
    Json(response.into_review())
}

/// Handle a validating admission review
pub async fn validate_handler(
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    let response = check(&req);
    record_admission("validate", Decision::from(response.allowed));
    Json(response.into_review())
}

fn is_workspace(req: &AdmissionRequest<DynamicObject>) -> bool {
    req.kind.group == TENANCY_GROUP && req.kind.kind == "Workspace"
}

fn decode(obj: &DynamicObject) -> Result<Workspace, WebhookError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

fn mutate(req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let allow = AdmissionResponse::from(req);
    if !is_workspace(req) {
        debug!(uid = %req.uid, kind = %req.kind.kind, "Not a workspace, allowing unchanged");
        return allow;
    }
    let Some(obj) = &req.object else {
        return allow;
    };

    let mut ws = match decode(obj) {
        Ok(ws) => ws,
        Err(e) => return allow.deny(e.to_string()),
    };
    let before = ws.metadata.labels.clone();

    if let Err(e) = admit(&mut ws) {
        warn!(uid = %req.uid, workspace = %ws.name_any(), error = %e, "Rejected workspace labels");
        return allow.deny(e.to_string());
    }

    let ops = label_patch(before.as_ref(), ws.labels());
    if ops.is_empty() {
        return allow;
    }

    info!(uid = %req.uid, workspace = %ws.name_any(), "Synchronizing workspace labels");
    match allow.clone().with_patch(json_patch::Patch(ops)) {
        Ok(response) => response,
        Err(e) => {
            error!(uid = %req.uid, error = %e, "Failed to serialize patch");
            allow.deny(format!("patch serialization error: {e}"))
        }
    }
}

fn check(req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let allow = AdmissionResponse::from(req);
    if !is_workspace(req) {
        return allow;
    }
    let Some(obj) = &req.object else {
        return allow;
    };

    let new = match decode(obj) {
        Ok(ws) => ws,
        Err(e) => return allow.deny(e.to_string()),
    };
    let old = match req.old_object.as_ref().map(decode).transpose() {
        Ok(old) => old,
        Err(e) => return allow.deny(e.to_string()),
    };

    match validate(old.as_ref(), &new) {
        Ok(()) => allow,
        Err(e) => {
            info!(uid = %req.uid, workspace = %new.name_any(), reason = %e, "Denied workspace write");
            allow.deny(e.to_string())
        }
    }
}

/// Patch replacing the full label map, or nothing if it is unchanged
fn label_patch(
    before: Option<&std::collections::BTreeMap<String, String>>,
    after: &std::collections::BTreeMap<String, String>,
) -> Vec<PatchOperation> {
    let path = PointerBuf::from_tokens(["metadata", "labels"]);
    let value = serde_json::to_value(after).unwrap_or_default();
    match before {
        Some(before) if before == after => Vec::new(),
        Some(_) => vec![PatchOperation::Replace(ReplaceOperation { path, value })],
        None => vec![PatchOperation::Add(AddOperation { path, value })],
    }
}
