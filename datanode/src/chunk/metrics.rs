use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [super::Registry].
#[derive(Default)]
pub struct Metrics {
    /// Number of registered chunks
    pub chunks: Gauge,
    /// Number of chunks removed
    pub removals: Counter,
    /// Number of chunk removals that failed
    pub removal_failures: Counter,
    /// Number of reader sweeps scheduled
    pub sweeps: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Metrics::default();
        context.register(
            "chunks",
            "Number of registered chunks",
            metrics.chunks.clone(),
        );
        context.register(
            "removals",
            "Number of chunks removed",
            metrics.removals.clone(),
        );
        context.register(
            "removal_failures",
            "Number of chunk removals that failed",
            metrics.removal_failures.clone(),
        );
        context.register(
            "sweeps",
            "Number of reader sweeps scheduled",
            metrics.sweeps.clone(),
        );
        metrics
    }
}
