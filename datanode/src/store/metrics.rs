use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [super::Store].
#[derive(Default)]
pub struct Metrics {
    /// Number of blocks read from disk
    pub block_reads: Counter,
    /// Number of block ranges read from disk
    pub range_reads: Counter,
    /// Number of chunk metas read from disk
    pub meta_reads: Counter,
    /// Number of failed reads
    pub read_failures: Counter,
    /// Number of reads in flight
    pub inflight: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Metrics::default();
        context.register(
            "block_reads",
            "Number of blocks read from disk",
            metrics.block_reads.clone(),
        );
        context.register(
            "range_reads",
            "Number of block ranges read from disk",
            metrics.range_reads.clone(),
        );
        context.register(
            "meta_reads",
            "Number of chunk metas read from disk",
            metrics.meta_reads.clone(),
        );
        context.register(
            "read_failures",
            "Number of failed reads",
            metrics.read_failures.clone(),
        );
        context.register(
            "inflight",
            "Number of reads in flight",
            metrics.inflight.clone(),
        );
        metrics
    }
}
