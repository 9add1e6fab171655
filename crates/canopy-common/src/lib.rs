//! Common types for Canopy: CRDs, logical-cluster keys, errors, caches and informers

#![deny(missing_docs)]

pub mod cache;
pub mod client;
pub mod crd;
pub mod error;
pub mod informer;
pub mod logicalcluster;
pub mod metrics;
pub mod telemetry;

pub use error::Error;
pub use logicalcluster::{ClusterAwareKey, LogicalCluster};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for tenancy resources (Workspace)
pub const TENANCY_GROUP: &str = "tenancy.canopy.dev";

/// API group for workload resources (WorkloadCluster)
pub const WORKLOAD_GROUP: &str = "workload.canopy.dev";

/// Annotation carrying the logical cluster an object belongs to
pub const LOGICAL_CLUSTER_ANNOTATION: &str = "tenancy.canopy.dev/cluster";

/// Prefix shared by every label the admission layer derives from workspace status
pub const INTERNAL_LABEL_PREFIX: &str = "internal.tenancy.canopy.dev/";

/// Label mirroring `status.phase` of a Workspace
pub const WORKSPACE_PHASE_LABEL: &str = "internal.tenancy.canopy.dev/phase";

/// Label on a namespace naming the WorkloadCluster it is placed on
pub const PLACEMENT_LABEL: &str = "workloads.canopy.dev/cluster";

/// Annotation marking a workspace whose namespaces must not be scheduled
pub const WORKSPACE_UNSCHEDULABLE_ANNOTATION: &str = "workloads.canopy.dev/unschedulable";

/// Field manager used for every write issued by Canopy controllers
pub const FIELD_MANAGER: &str = "canopy-controller";

/// Watcher timeout (seconds), kept below the client read timeout so idle
/// watches are closed by the API server first
pub const WATCH_TIMEOUT_SECS: u32 = 25;
