//! Prometheus metrics collection.
//!
//! Provides pipeline metrics in Prometheus format. Per-team app metrics that
//! end up in the database live in [`app_metrics`].

pub mod app_metrics;
mod reporter;

use prometheus_client::encoding::{EncodeLabelSet, text::encode};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use crate::models::TeamId;

pub use app_metrics::{AppMetric, AppMetricRow, AppMetrics, ErrorDetail, MetricCategory};
pub use reporter::{PipelineReporter, Reporter};

/// Plugin invocation labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InvocationLabels {
    /// Metric name, e.g. `plugin.process_event`.
    pub metric: String,
    pub plugin: String,
    pub team: String,
}

/// Cache labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    pub cache: String,
}

/// Reload signal labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReloadLabels {
    pub kind: String,
}

/// Pipeline metrics.
pub struct Metrics {
    registry: Registry,

    /// Per-attempt plugin call duration.
    pub invocation_duration_seconds: Family<InvocationLabels, Histogram>,

    /// Named plugin counters (`plugin.process_event.ERROR`, ...).
    pub invocation_counts: Family<InvocationLabels, Counter>,

    /// Cache hit counter by cache name.
    pub cache_hits: Family<CacheLabels, Counter>,

    /// Cache miss counter by cache name.
    pub cache_misses: Family<CacheLabels, Counter>,

    /// Plugin handles instantiated.
    pub handles_created: Counter,

    /// Plugin handles disposed.
    pub handles_disposed: Counter,

    /// Events dropped by a `process_event`.
    pub events_dropped: Counter,

    /// Reload signals applied, by kind.
    pub reload_signals: Family<ReloadLabels, Counter>,
}

impl Metrics {
    /// Create a new metrics registry.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let invocation_duration_seconds =
            Family::<InvocationLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.0001, 2.0, 16))
            });
        registry.register(
            "plugin_invocation_duration_seconds",
            "Plugin invocation duration in seconds, per attempt",
            invocation_duration_seconds.clone(),
        );

        let invocation_counts = Family::<InvocationLabels, Counter>::default();
        registry.register(
            "plugin_invocation_events",
            "Named plugin invocation counters",
            invocation_counts.clone(),
        );

        let cache_hits = Family::<CacheLabels, Counter>::default();
        registry.register("plugin_cache_hits", "Plugin cache hits", cache_hits.clone());

        let cache_misses = Family::<CacheLabels, Counter>::default();
        registry.register(
            "plugin_cache_misses",
            "Plugin cache misses",
            cache_misses.clone(),
        );

        let handles_created = Counter::default();
        registry.register(
            "plugin_handles_created",
            "Plugin handles instantiated",
            handles_created.clone(),
        );

        let handles_disposed = Counter::default();
        registry.register(
            "plugin_handles_disposed",
            "Plugin handles disposed",
            handles_disposed.clone(),
        );

        let events_dropped = Counter::default();
        registry.register(
            "plugin_events_dropped",
            "Events dropped by process_event",
            events_dropped.clone(),
        );

        let reload_signals = Family::<ReloadLabels, Counter>::default();
        registry.register(
            "plugin_reload_signals",
            "Reload signals applied",
            reload_signals.clone(),
        );

        Self {
            registry,
            invocation_duration_seconds,
            invocation_counts,
            cache_hits,
            cache_misses,
            handles_created,
            handles_disposed,
            events_dropped,
            reload_signals,
        }
    }

    /// Record one invocation attempt.
    pub fn record_timing(&self, metric: &str, plugin: &str, team_id: TeamId, duration_secs: f64) {
        self.invocation_duration_seconds
            .get_or_create(&labels(metric, plugin, team_id))
            .observe(duration_secs);
    }

    /// Increment a named plugin counter.
    pub fn increment(&self, metric: &str, plugin: &str, team_id: TeamId) {
        self.invocation_counts
            .get_or_create(&labels(metric, plugin, team_id))
            .inc();
    }

    /// Current value of a named plugin counter.
    pub fn count(&self, metric: &str, plugin: &str, team_id: TeamId) -> u64 {
        self.invocation_counts
            .get_or_create(&labels(metric, plugin, team_id))
            .get()
    }

    /// Record a cache lookup.
    pub fn record_cache(&self, cache: &str, hit: bool) {
        let labels = CacheLabels {
            cache: cache.to_string(),
        };
        if hit {
            self.cache_hits.get_or_create(&labels).inc();
        } else {
            self.cache_misses.get_or_create(&labels).inc();
        }
    }

    /// Record an applied reload signal.
    pub fn record_reload(&self, kind: &str) {
        self.reload_signals
            .get_or_create(&ReloadLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Panics
    ///
    /// Panics if Prometheus metric encoding to a `String` buffer fails.
    /// The `fmt::Write` impl for `String` is infallible, and all metric
    /// labels use derived `EncodeLabelSet` impls that do not produce
    /// `fmt::Error`.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        // Prometheus encoding to String buffer is infallible
        #[allow(clippy::expect_used)]
        encode(&mut buffer, &self.registry).expect("encoding metrics");
        buffer
    }
}

fn labels(metric: &str, plugin: &str, team_id: TeamId) -> InvocationLabels {
    InvocationLabels {
        metric: metric.to_string(),
        plugin: plugin.to_string(),
        team: team_id.to_string(),
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish()
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        let output = metrics.encode();
        assert!(output.contains("plugin_handles_created"));
        assert!(output.contains("plugin_events_dropped"));
    }

    #[test]
    fn test_record_timing_and_counters() {
        let metrics = Metrics::new();
        metrics.record_timing("plugin.process_event", "geoip", 2, 0.004);
        metrics.increment("plugin.process_event.ERROR", "geoip", 2);
        metrics.increment("plugin.process_event.ERROR", "geoip", 2);

        assert_eq!(metrics.count("plugin.process_event.ERROR", "geoip", 2), 2);
        assert_eq!(metrics.count("plugin.process_event.ERROR", "geoip", 3), 0);

        let output = metrics.encode();
        assert!(output.contains("plugin_invocation_duration_seconds"));
        assert!(output.contains("metric=\"plugin.process_event.ERROR\""));
        assert!(output.contains("team=\"2\""));
    }

    #[test]
    fn test_cache_and_reload_counters() {
        let metrics = Metrics::new();
        metrics.record_cache("teams", true);
        metrics.record_cache("teams", false);
        metrics.record_reload("definition");

        let output = metrics.encode();
        assert!(output.contains("plugin_cache_hits_total{cache=\"teams\"} 1"));
        assert!(output.contains("plugin_cache_misses_total{cache=\"teams\"} 1"));
        assert!(output.contains("kind=\"definition\""));
    }
}
