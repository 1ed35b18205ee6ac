//! Per-team app metrics.
//!
//! Successes and failures are aggregated in memory by
//! (team, config, category, job, error type) and periodically flushed to an
//! [`AppMetricsSink`] as one row per aggregate.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ingestion_sdk::types::PluginEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{ConfigId, TeamId};
use crate::store::AppMetricsSink;

/// What kind of plugin work a metric describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricCategory {
    ProcessEvent,
    OnEvent,
    ScheduledTask,
}

impl MetricCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessEvent => "processEvent",
            Self::OnEvent => "onEvent",
            Self::ScheduledTask => "scheduledTask",
        }
    }

    /// Base name of the timing metric and its `.ERROR` counter.
    pub fn metric_name(&self) -> &'static str {
        match self {
            Self::ProcessEvent => "plugin.process_event",
            Self::OnEvent => "plugin.on_event",
            Self::ScheduledTask => "plugin.task",
        }
    }
}

impl fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outcome to add to the aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMetric {
    pub team_id: TeamId,
    pub plugin_config_id: ConfigId,
    pub category: MetricCategory,
    pub job_id: Option<String>,
    pub successes: u64,
    pub successes_on_retry: u64,
    pub failures: u64,
}

impl AppMetric {
    pub fn new(team_id: TeamId, plugin_config_id: ConfigId, category: MetricCategory) -> Self {
        Self {
            team_id,
            plugin_config_id,
            category,
            job_id: None,
            successes: 0,
            successes_on_retry: 0,
            failures: 0,
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// A success; `attempts > 1` also counts as a success on retry.
    pub fn success(mut self, attempts: u32) -> Self {
        self.successes = 1;
        self.successes_on_retry = u64::from(attempts > 1);
        self
    }

    pub fn failure(mut self) -> Self {
        self.failures = 1;
        self
    }
}

/// The error behind a failure metric.
#[derive(Debug, Clone)]
pub struct ErrorDetail {
    /// Error kind, used as the aggregation key.
    pub kind: String,
    pub message: String,
    pub event: Option<PluginEvent>,
}

/// A flushed aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct AppMetricRow {
    pub timestamp: DateTime<Utc>,
    pub team_id: TeamId,
    pub plugin_config_id: ConfigId,
    pub category: MetricCategory,
    pub job_id: Option<String>,
    pub successes: u64,
    pub successes_on_retry: u64,
    pub failures: u64,
    pub error_uuid: Option<Uuid>,
    pub error_type: Option<String>,
    pub error_details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AggregateKey {
    team_id: TeamId,
    plugin_config_id: ConfigId,
    category: MetricCategory,
    job_id: Option<String>,
    error_type: Option<String>,
}

#[derive(Debug)]
struct Aggregate {
    first_seen: DateTime<Utc>,
    successes: u64,
    successes_on_retry: u64,
    failures: u64,
    error: Option<(Uuid, Value)>,
}

/// Queue of pending app metrics.
#[derive(Debug, Default)]
pub struct AppMetrics {
    pending: Mutex<HashMap<AggregateKey, Aggregate>>,
}

impl AppMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an outcome to its aggregate.
    pub fn queue_metric(&self, metric: AppMetric) {
        self.add(metric, None);
    }

    /// Add a failure, aggregated per error kind. The first error's details
    /// are kept.
    pub fn queue_error(&self, metric: AppMetric, error: ErrorDetail) {
        self.add(metric, Some(error));
    }

    fn add(&self, metric: AppMetric, error: Option<ErrorDetail>) {
        let key = AggregateKey {
            team_id: metric.team_id,
            plugin_config_id: metric.plugin_config_id,
            category: metric.category,
            job_id: metric.job_id,
            error_type: error.as_ref().map(|e| e.kind.clone()),
        };

        let mut pending = self.pending.lock();
        let aggregate = pending.entry(key).or_insert_with(|| Aggregate {
            first_seen: Utc::now(),
            successes: 0,
            successes_on_retry: 0,
            failures: 0,
            error: None,
        });
        aggregate.successes += metric.successes;
        aggregate.successes_on_retry += metric.successes_on_retry;
        aggregate.failures += metric.failures;

        match error {
            Some(error) if aggregate.error.is_none() => {
                let details = json!({
                    "error": { "name": error.kind, "message": error.message },
                    "event": error.event,
                });
                aggregate.error = Some((Uuid::now_v7(), details));
            }
            _ => {}
        }
    }

    /// Number of pending aggregates.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every pending aggregate as a row.
    pub fn drain(&self) -> Vec<AppMetricRow> {
        let pending = std::mem::take(&mut *self.pending.lock());
        pending
            .into_iter()
            .map(|(key, aggregate)| {
                let (error_uuid, error_details) = match aggregate.error {
                    Some((uuid, details)) => (Some(uuid), Some(details)),
                    None => (None, None),
                };
                AppMetricRow {
                    timestamp: aggregate.first_seen,
                    team_id: key.team_id,
                    plugin_config_id: key.plugin_config_id,
                    category: key.category,
                    job_id: key.job_id,
                    successes: aggregate.successes,
                    successes_on_retry: aggregate.successes_on_retry,
                    failures: aggregate.failures,
                    error_uuid,
                    error_type: key.error_type,
                    error_details,
                }
            })
            .collect()
    }

    /// Write every pending aggregate to `sink`.
    ///
    /// Returns the number of rows written. Rows are dropped if the write
    /// fails.
    pub async fn flush(&self, sink: &dyn AppMetricsSink) -> Result<usize> {
        let rows = self.drain();
        if rows.is_empty() {
            return Ok(0);
        }

        sink.write_app_metrics(&rows)
            .await
            .with_context(|| format!("failed to write {} app metric rows", rows.len()))?;
        debug!(rows = rows.len(), "flushed app metrics");
        Ok(rows.len())
    }

    /// Flush every `every` until `stop_rx` flips to true, then flush once more.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        sink: Arc<dyn AppMetricsSink>,
        every: Duration,
        mut stop_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = metrics.flush(sink.as_ref()).await {
                            warn!(error = %e, "app metrics flush failed");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            debug!("app metrics flusher stopping");
                            break;
                        }
                    }
                }
            }

            if let Err(e) = metrics.flush(sink.as_ref()).await {
                warn!(error = %e, "final app metrics flush failed");
            }
        })
    }
}
