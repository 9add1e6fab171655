//! Namespace scheduler
//!
//! Watches Namespaces, WorkloadClusters and Workspaces across all logical
//! clusters and keeps every tenant namespace labeled with the WorkloadCluster
//! it runs on. See [`controller`] for the placement rules and [`queue`] for
//! the rate-limited work queue driving the workers.

#![deny(missing_docs)]

pub mod client;
pub mod controller;
pub mod queue;

pub use client::{NamespaceClient, NamespaceClientImpl};
pub use controller::{
    Context, ContextBuilder, NamespaceScheduler, NoRebalance, QueueKind, RebalancePolicy,
    NAMESPACE_BLOCKLIST,
};
pub use queue::{RateLimiterConfig, WorkQueue};
