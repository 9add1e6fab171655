//! Workspace Custom Resource Definition
//!
//! A Workspace describes a logical cluster carved out of its parent. Its
//! status walks `Scheduling -> Initializing -> Ready`; the admission layer
//! keeps the `internal.tenancy.canopy.dev/*` labels in lockstep with it.

use std::collections::BTreeSet;
use std::str::FromStr;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::logicalcluster::LogicalCluster;
use crate::WORKSPACE_UNSCHEDULABLE_ANNOTATION;

/// Specification for a Workspace
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tenancy.canopy.dev",
    version = "v1alpha1",
    kind = "Workspace",
    plural = "workspaces",
    shortname = "ws",
    status = "WorkspaceStatus",
    namespaced = false,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".status.baseURL"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
    /// Workspace type, immutable after creation
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_: String,
}

/// Lifecycle phase of a Workspace
///
/// Phases are ordered; the admission layer rejects any backward move.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum WorkspacePhase {
    /// Waiting for a location to be assigned
    #[default]
    Scheduling,
    /// Placed, initializers still running
    Initializing,
    /// Usable by members
    Ready,
}

impl std::fmt::Display for WorkspacePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduling => write!(f, "Scheduling"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

impl FromStr for WorkspacePhase {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Scheduling" => Ok(Self::Scheduling),
            "Initializing" => Ok(Self::Initializing),
            "Ready" => Ok(Self::Ready),
            other => Err(crate::Error::validation(format!(
                "unknown workspace phase {other:?}"
            ))),
        }
    }
}

/// Physical placement of a Workspace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceLocation {
    /// Shard currently serving the workspace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,

    /// Shard the workspace is moving to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Status for a Workspace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: WorkspacePhase,

    /// Pending initializers; treated as a set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initializers: Vec<String>,

    /// Placement of the workspace
    #[serde(default)]
    pub location: WorkspaceLocation,

    /// Externally reachable URL of the workspace content
    #[serde(default, rename = "baseURL", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Conditions reported by controllers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl Workspace {
    /// Phase, defaulting to Scheduling when status is absent
    pub fn phase(&self) -> WorkspacePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Pending initializers as a set
    pub fn initializers(&self) -> BTreeSet<&str> {
        self.status
            .as_ref()
            .map(|s| s.initializers.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// `status.location.current`, `None` when unset or empty
    pub fn current_location(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| non_empty(&s.location.current))
    }

    /// `status.baseURL`, `None` when unset or empty
    pub fn base_url(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| non_empty(&s.base_url))
    }

    /// Logical cluster holding this workspace's content
    pub fn content_cluster(&self) -> LogicalCluster {
        LogicalCluster::from_object(self).join(&self.name_any())
    }

    /// True when namespaces inside this workspace must not be placed
    pub fn is_unschedulable(&self) -> bool {
        self.annotations()
            .get(WORKSPACE_UNSCHEDULABLE_ANNOTATION)
            .is_some_and(|v| v == "true")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LOGICAL_CLUSTER_ANNOTATION;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    #[test]
    fn phases_are_ordered() {
        assert!(WorkspacePhase::Scheduling < WorkspacePhase::Initializing);
        assert!(WorkspacePhase::Initializing < WorkspacePhase::Ready);
        assert_eq!(WorkspacePhase::default(), WorkspacePhase::Scheduling);
    }

    #[test]
    fn phase_parses_its_display() {
        for phase in [
            WorkspacePhase::Scheduling,
            WorkspacePhase::Initializing,
            WorkspacePhase::Ready,
        ] {
            assert_eq!(phase.to_string().parse::<WorkspacePhase>().unwrap(), phase);
        }
        assert!("Deleting".parse::<WorkspacePhase>().is_err());
    }

    #[test]
    fn status_uses_base_url_field_name() {
        let status = WorkspaceStatus {
            base_url: Some("https://shard-1/clusters/root:acme".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["baseURL"], "https://shard-1/clusters/root:acme");
        assert_eq!(json["phase"], "Scheduling");
    }

    #[test]
    fn empty_strings_count_as_unset() {
        let mut ws = Workspace::new("ws1", WorkspaceSpec::default());
        ws.status = Some(WorkspaceStatus {
            base_url: Some(String::new()),
            location: WorkspaceLocation {
                current: Some(String::new()),
                target: None,
            },
            ..Default::default()
        });
        assert_eq!(ws.base_url(), None);
        assert_eq!(ws.current_location(), None);
    }

    #[test]
    fn content_cluster_appends_workspace_name() {
        let mut ws = Workspace::new("team", WorkspaceSpec::default());
        ws.metadata = ObjectMeta {
            name: Some("team".into()),
            annotations: Some(BTreeMap::from([(
                LOGICAL_CLUSTER_ANNOTATION.to_string(),
                "root:acme".to_string(),
            )])),
            ..Default::default()
        };
        assert_eq!(ws.content_cluster().as_str(), "root:acme:team");
    }

    #[test]
    fn unschedulable_annotation_must_be_true() {
        let mut ws = Workspace::new("ws1", WorkspaceSpec::default());
        assert!(!ws.is_unschedulable());
        ws.annotations_mut().insert(
            WORKSPACE_UNSCHEDULABLE_ANNOTATION.to_string(),
            "false".to_string(),
        );
        assert!(!ws.is_unschedulable());
        ws.annotations_mut().insert(
            WORKSPACE_UNSCHEDULABLE_ANNOTATION.to_string(),
            "true".to_string(),
        );
        assert!(ws.is_unschedulable());
    }
}
