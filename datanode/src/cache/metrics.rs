use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [super::WeightedCache].
#[derive(Default)]
pub struct Metrics {
    /// Number of lookups served from the cache
    pub hits: Counter,
    /// Number of lookups that found nothing cached
    pub misses: Counter,
    /// Number of entries inserted
    pub inserts: Counter,
    /// Number of entries evicted to stay within capacity
    pub evictions: Counter,
    /// Number of entries not retained because memory could not be reserved
    pub rejected: Counter,
    /// Number of entries retained
    pub items: Gauge,
    /// Total weight of retained entries
    pub weight: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Metrics::default();
        context.register(
            "hits",
            "Number of lookups served from the cache",
            metrics.hits.clone(),
        );
        context.register(
            "misses",
            "Number of lookups that found nothing cached",
            metrics.misses.clone(),
        );
        context.register(
            "inserts",
            "Number of entries inserted",
            metrics.inserts.clone(),
        );
        context.register(
            "evictions",
            "Number of entries evicted to stay within capacity",
            metrics.evictions.clone(),
        );
        context.register(
            "rejected",
            "Number of entries not retained because memory could not be reserved",
            metrics.rejected.clone(),
        );
        context.register("items", "Number of entries retained", metrics.items.clone());
        context.register(
            "weight",
            "Total weight of retained entries",
            metrics.weight.clone(),
        );
        metrics
    }
}
