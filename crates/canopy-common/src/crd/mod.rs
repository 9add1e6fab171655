//! Custom Resource Definitions for Canopy

mod types;
mod workload_cluster;
mod workspace;

pub use types::{is_condition_true, Condition, ConditionStatus};
pub use workload_cluster::{WorkloadCluster, WorkloadClusterSpec, WorkloadClusterStatus};
pub use workspace::{
    Workspace, WorkspaceLocation, WorkspacePhase, WorkspaceSpec, WorkspaceStatus,
};
