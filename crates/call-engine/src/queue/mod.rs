//! Call queue management module
//!
//! Two queues live here. The inbound [`HoldingQueue`] orders callers already on
//! the line; the outbound queue is the set of `queue_entries` rows kept in sync
//! with subject eligibility by the [`QueueReconciler`].

pub mod holding;
pub mod reconciler;

pub use holding::{estimate_wait_secs, EnqueueResult, HoldingQueue, InboundCall};
pub use reconciler::{
    detect_drift, ChangeCounts, DriftCounts, DriftKind, QueueReconciler, ReconcileParams, ReconciliationReport,
    RunOutcome, SubjectFailure,
};
