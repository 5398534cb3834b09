//! Metrics for iroh-feeds

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics of the subscription engine.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "feeds")]
#[non_exhaustive]
pub struct Metrics {
    /// Records admitted into a topic.
    pub records_admitted: Counter,
    /// Records dropped because their key was already delivered.
    pub records_duplicate: Counter,
    /// Records dropped by the record validator.
    pub records_malformed: Counter,
    /// Live records which incremented an unread count.
    pub unread_increments: Counter,

    /// Subscriptions started.
    pub activations: Counter,
    /// Subscriptions stopped.
    pub deactivations: Counter,
    /// Subscriptions renewed because they went stale.
    pub renewals: Counter,
    /// Debounced rehydration passes after peer discovery.
    pub rehydration_passes: Counter,
    /// Failed topics retried by the renewal check or an online transition.
    pub retries: Counter,

    /// Merged record streams which ended with an error.
    pub source_failures: Counter,
    /// Per-topic failures during scheduler passes.
    pub scheduler_failures: Counter,
}
