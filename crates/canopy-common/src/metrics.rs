//! Metrics registry for Canopy
//!
//! Instruments are created lazily from the global meter, so they are no-ops
//! until a meter provider is installed by `telemetry::init_telemetry`.

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: Lazy<Meter> = Lazy::new(|| global::meter("canopy"));

// ============================================================================
// Work Queue Metrics
// ============================================================================

/// Counter of keys added to a work queue
///
/// Labels:
/// - `queue`: namespace, cluster, workspace
pub static QUEUE_ADDS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("canopy_workqueue_adds_total")
        .with_description("Total number of keys added to a work queue")
        .with_unit("{keys}")
        .build()
});

/// Counter of rate-limited re-adds
///
/// Labels:
/// - `queue`
pub static QUEUE_RETRIES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("canopy_workqueue_retries_total")
        .with_description("Total number of rate-limited requeues")
        .with_unit("{keys}")
        .build()
});

/// Gauge of keys waiting in a queue
///
/// Labels:
/// - `queue`
pub static QUEUE_DEPTH: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("canopy_workqueue_depth")
        .with_description("Number of keys waiting to be processed")
        .with_unit("{keys}")
        .build()
});

// ============================================================================
// Reconcile Metrics
// ============================================================================

/// Histogram of reconcile duration
///
/// Labels:
/// - `queue`
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("canopy_reconcile_duration_seconds")
        .with_description("Duration of one reconcile pass in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconcile errors that were requeued
///
/// Labels:
/// - `queue`
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("canopy_reconcile_errors_total")
        .with_description("Total number of failed reconciles that were requeued")
        .with_unit("{errors}")
        .build()
});

/// Counter of keys dropped after a permanent failure
///
/// Labels:
/// - `queue`
/// - `reason`: malformed_key, permanent
pub static RECONCILE_DROPPED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("canopy_reconcile_dropped_total")
        .with_description("Total number of keys dropped without retry")
        .with_unit("{keys}")
        .build()
});

/// Counter of namespace placement decisions
///
/// Labels:
/// - `action`: placed, unplaced, kept
pub static NAMESPACE_PLACEMENTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("canopy_namespace_placements_total")
        .with_description("Total number of namespace placement decisions")
        .with_unit("{decisions}")
        .build()
});

// ============================================================================
// Admission Metrics
// ============================================================================

/// Counter of admission decisions
///
/// Labels:
/// - `operation`: mutate, validate
/// - `decision`: allow, deny
pub static ADMISSION_DECISIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("canopy_admission_decisions_total")
        .with_description("Total number of workspace admission decisions")
        .with_unit("{decisions}")
        .build()
});

// ============================================================================
// Authorization Metrics
// ============================================================================

/// Counter of authorization cache recomputations
///
/// Labels:
/// - `org`: logical cluster of the organization
/// - `trigger`: workspace, cluster_role, cluster_role_binding, full_sync
pub static AUTHZ_RECOMPUTATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("canopy_authz_recomputations_total")
        .with_description("Total number of authorization cache recomputations")
        .with_unit("{recomputations}")
        .build()
});

/// Counter of watchers closed because they fell behind
pub static AUTHZ_WATCHERS_TERMINATED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("canopy_authz_watchers_terminated_total")
        .with_description("Total number of slow workspace watchers terminated")
        .with_unit("{watchers}")
        .build()
});

/// Counter of content-gate decisions
///
/// Labels:
/// - `decision`: allow, deny
/// - `via`: initializer, member
pub static CONTENT_DECISIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("canopy_content_decisions_total")
        .with_description("Total number of workspace content access decisions")
        .with_unit("{decisions}")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Label values for allow/deny outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Request was allowed
    Allow,
    /// Request was denied
    Deny,
}

impl Decision {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

impl From<bool> for Decision {
    fn from(allowed: bool) -> Self {
        if allowed {
            Self::Allow
        } else {
            Self::Deny
        }
    }
}

/// Record an admission decision
pub fn record_admission(operation: &'static str, decision: Decision) {
    ADMISSION_DECISIONS.add(
        1,
        &[
            KeyValue::new("operation", operation),
            KeyValue::new("decision", decision.as_str()),
        ],
    );
}

/// Times one reconcile pass of a named queue
pub struct ReconcileTimer {
    queue: &'static str,
    start: Instant,
}

impl ReconcileTimer {
    /// Start timing
    pub fn start(queue: &'static str) -> Self {
        Self {
            queue,
            start: Instant::now(),
        }
    }

    /// Record a successful pass
    pub fn success(self) {
        self.record("success");
    }

    /// Record a failed pass that will be retried
    pub fn requeued(self) {
        RECONCILE_ERRORS.add(1, &[KeyValue::new("queue", self.queue)]);
        self.record("error");
    }

    /// Record a failed pass whose key is dropped
    pub fn dropped(self, reason: &'static str) {
        RECONCILE_DROPPED.add(
            1,
            &[
                KeyValue::new("queue", self.queue),
                KeyValue::new("reason", reason),
            ],
        );
        self.record("error");
    }

    fn record(self, result: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("queue", self.queue),
                KeyValue::new("result", result),
            ],
        );
    }
}
