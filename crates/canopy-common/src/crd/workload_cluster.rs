//! WorkloadCluster Custom Resource Definition
//!
//! Registers a physical cluster that may receive tenant namespaces. The
//! scheduler only places namespaces on clusters reporting `Ready=True` that
//! are not cordoned with `spec.unschedulable`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{is_condition_true, Condition};

/// Condition type a cluster reports once its syncer is healthy
pub const READY_CONDITION: &str = "Ready";

/// Specification for a WorkloadCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "workload.canopy.dev",
    version = "v1alpha1",
    kind = "WorkloadCluster",
    plural = "workloadclusters",
    shortname = "wlc",
    status = "WorkloadClusterStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Unschedulable","type":"boolean","jsonPath":".spec.unschedulable"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadClusterSpec {
    /// Cordon the cluster: no new namespaces, existing ones are moved away
    #[serde(default)]
    pub unschedulable: bool,
}

/// Status for a WorkloadCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadClusterStatus {
    /// Health conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl WorkloadCluster {
    /// True when the cluster is Ready and not cordoned
    pub fn is_schedulable(&self) -> bool {
        !self.spec.unschedulable
            && self
                .status
                .as_ref()
                .is_some_and(|s| is_condition_true(&s.conditions, READY_CONDITION))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ConditionStatus;
    use rstest::rstest;

    fn cluster(unschedulable: bool, ready: Option<ConditionStatus>) -> WorkloadCluster {
        let mut c = WorkloadCluster::new("east", WorkloadClusterSpec { unschedulable });
        c.status = ready.map(|status| WorkloadClusterStatus {
            conditions: vec![Condition::new(READY_CONDITION, status, "Heartbeat", "")],
        });
        c
    }

    #[rstest]
    #[case::ready(false, Some(ConditionStatus::True), true)]
    #[case::cordoned(true, Some(ConditionStatus::True), false)]
    #[case::not_ready(false, Some(ConditionStatus::False), false)]
    #[case::unknown(false, Some(ConditionStatus::Unknown), false)]
    #[case::no_status(false, None, false)]
    fn schedulability(
        #[case] unschedulable: bool,
        #[case] ready: Option<ConditionStatus>,
        #[case] expected: bool,
    ) {
        assert_eq!(cluster(unschedulable, ready).is_schedulable(), expected);
    }
}
