//! Metrics for the [Engine](crate::Engine).

use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [Engine](crate::Engine).
#[derive(Default)]
pub struct Metrics {
    /// Number of surveys created
    pub surveys: Counter,
    /// Number of client responses collected
    pub responses: Counter,
    /// Number of results queries served successfully
    pub queries: Counter,
    /// Number of protocol messages processed (ring hops and tree folds)
    pub hops: Counter,
    /// Number of protocol instances or queries that failed
    pub failures: Counter,
    /// Number of query pipelines currently running
    pub pipelines: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Self::default();
        context.register("surveys", "Number of surveys created", metrics.surveys.clone());
        context.register(
            "responses",
            "Number of client responses collected",
            metrics.responses.clone(),
        );
        context.register(
            "queries",
            "Number of results queries served successfully",
            metrics.queries.clone(),
        );
        context.register(
            "hops",
            "Number of protocol messages processed",
            metrics.hops.clone(),
        );
        context.register(
            "failures",
            "Number of protocol instances or queries that failed",
            metrics.failures.clone(),
        );
        context.register(
            "pipelines",
            "Number of query pipelines currently running",
            metrics.pipelines.clone(),
        );
        metrics
    }
}
