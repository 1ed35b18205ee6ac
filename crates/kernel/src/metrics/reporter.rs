//! Outcome reporting for plugin invocations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, warn};

use super::Metrics;
use super::app_metrics::{AppMetric, AppMetrics, ErrorDetail};
use crate::models::TeamId;
use crate::store::{ErrorStore, PluginErrorRecord};

/// Where the invocation wrapper sends timings, counters, errors and app
/// metrics.
#[async_trait]
pub trait PipelineReporter: Send + Sync {
    fn record_timing(&self, metric: &str, plugin: &str, team_id: TeamId, elapsed: Duration);

    fn increment(&self, metric: &str, plugin: &str, team_id: TeamId);

    /// Persist a final failure. Never fails; storage problems are logged.
    async fn record_error(&self, record: PluginErrorRecord);

    fn queue_success(&self, metric: AppMetric);

    fn queue_failure(&self, metric: AppMetric, error: ErrorDetail);
}

/// Reporter backed by Prometheus, the app metrics queue and an error store.
pub struct Reporter {
    metrics: Arc<Metrics>,
    app_metrics: Arc<AppMetrics>,
    errors: Arc<dyn ErrorStore>,
}

impl Reporter {
    pub fn new(
        metrics: Arc<Metrics>,
        app_metrics: Arc<AppMetrics>,
        errors: Arc<dyn ErrorStore>,
    ) -> Self {
        Self {
            metrics,
            app_metrics,
            errors,
        }
    }
}

#[async_trait]
impl PipelineReporter for Reporter {
    fn record_timing(&self, metric: &str, plugin: &str, team_id: TeamId, elapsed: Duration) {
        self.metrics
            .record_timing(metric, plugin, team_id, elapsed.as_secs_f64());
    }

    fn increment(&self, metric: &str, plugin: &str, team_id: TeamId) {
        self.metrics.increment(metric, plugin, team_id);
    }

    async fn record_error(&self, record: PluginErrorRecord) {
        error!(
            team_id = record.team_id,
            config_id = record.config_id,
            plugin = %record.plugin,
            category = %record.category,
            kind = %record.kind,
            error = %record.message,
            "plugin failed"
        );

        if let Err(e) = self.errors.record_plugin_error(&record).await {
            warn!(
                team_id = record.team_id,
                config_id = record.config_id,
                error = %e,
                "failed to persist plugin error"
            );
        }
    }

    fn queue_success(&self, metric: AppMetric) {
        self.app_metrics.queue_metric(metric);
    }

    fn queue_failure(&self, metric: AppMetric, error: ErrorDetail) {
        self.app_metrics.queue_error(metric, error);
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::metrics::MetricCategory;
    use crate::store::MemoryPluginStore;
    use chrono::Utc;

    fn record() -> PluginErrorRecord {
        PluginErrorRecord {
            team_id: 1,
            config_id: 7,
            plugin: "geoip".to_string(),
            category: MetricCategory::OnEvent,
            kind: "Raised".to_string(),
            message: "boom".to_string(),
            event: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn errors_are_persisted() {
        let store = Arc::new(MemoryPluginStore::new());
        let reporter = Reporter::new(
            Arc::new(Metrics::new()),
            Arc::new(AppMetrics::new()),
            store.clone(),
        );

        reporter.record_error(record()).await;
        let errors = store.plugin_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].config_id, 7);
    }

    #[test]
    fn counters_and_app_metrics_are_forwarded() {
        let metrics = Arc::new(Metrics::new());
        let app_metrics = Arc::new(AppMetrics::new());
        let reporter = Reporter::new(
            metrics.clone(),
            app_metrics.clone(),
            Arc::new(MemoryPluginStore::new()),
        );

        reporter.increment("plugin.on_event.ERROR", "geoip", 1);
        reporter.record_timing("plugin.on_event", "geoip", 1, Duration::from_millis(3));
        reporter.queue_success(AppMetric::new(1, 7, MetricCategory::OnEvent).success(1));

        assert_eq!(metrics.count("plugin.on_event.ERROR", "geoip", 1), 1);
        assert_eq!(app_metrics.len(), 1);
    }
}
