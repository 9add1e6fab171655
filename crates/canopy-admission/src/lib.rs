//! Workspace lifecycle admission for Canopy
//!
//! [`lifecycle`] holds the pure transition and label rules; [`webhook`]
//! exposes them as Kubernetes admission endpoints.

#![deny(missing_docs)]

pub mod lifecycle;
pub mod webhook;

pub use lifecycle::{admit, derived_labels, initializer_label_key, validate};
pub use webhook::router;
