//! Retry and metrics wrapper around every plugin call.
//!
//! Each attempt is timed. A call that finally fails counts a
//! `<metric>.ERROR`, is reported to the error store and queues a failure app
//! metric; a call that succeeds queues a success app metric.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use ingestion_sdk::types::PluginEvent;
use tracing::debug;

use super::retry::{Attempted, Backoff, RetryPolicy, retry};
use crate::error::ExtensionError;
use crate::metrics::{AppMetric, ErrorDetail, MetricCategory, PipelineReporter};
use crate::models::LoadedExtension;
use crate::plugin::InvocationError;
use crate::store::PluginErrorRecord;

/// Retry policy per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePolicies {
    pub process_event: RetryPolicy,
    pub on_event: RetryPolicy,
    pub scheduled_task: RetryPolicy,
}

impl StagePolicies {
    pub fn for_category(&self, category: MetricCategory) -> &RetryPolicy {
        match category {
            MetricCategory::ProcessEvent => &self.process_event,
            MetricCategory::OnEvent => &self.on_event,
            MetricCategory::ScheduledTask => &self.scheduled_task,
        }
    }
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            process_event: RetryPolicy::once(),
            on_event: RetryPolicy::new(
                5,
                Backoff::exponential(Duration::from_secs(5), Duration::from_secs(60)),
            ),
            scheduled_task: RetryPolicy::once(),
        }
    }
}

/// Decides whether a failed attempt is retried.
pub type RetryPredicate = Arc<dyn Fn(&InvocationError) -> bool + Send + Sync>;

/// What is being invoked, for metrics and reports.
#[derive(Debug, Clone, Copy)]
pub struct InvocationContext<'a> {
    pub extension: &'a LoadedExtension,
    pub category: MetricCategory,
    /// The event being processed, attached to error reports.
    pub event: Option<&'a PluginEvent>,
    /// Task name for scheduled tasks and jobs.
    pub job_id: Option<&'a str>,
    /// Whether the outcome is queued as an app metric.
    pub queue_app_metric: bool,
}

impl<'a> InvocationContext<'a> {
    pub fn new(extension: &'a LoadedExtension, category: MetricCategory) -> Self {
        Self {
            extension,
            category,
            event: None,
            job_id: None,
            queue_app_metric: true,
        }
    }

    pub fn with_event(mut self, event: &'a PluginEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_job(mut self, job_id: &'a str) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn queue_app_metric(mut self, queue: bool) -> Self {
        self.queue_app_metric = queue;
        self
    }

    fn app_metric(&self) -> AppMetric {
        let metric = AppMetric::new(
            self.extension.config.team_id,
            self.extension.config.id,
            self.category,
        );
        match self.job_id {
            Some(job) => metric.with_job(job),
            None => metric,
        }
    }
}

/// Runs plugin calls under the stage's retry policy and reports outcomes.
pub struct Invoker {
    policies: StagePolicies,
    should_retry: RetryPredicate,
    reporter: Arc<dyn PipelineReporter>,
}

impl Invoker {
    /// Invoker retrying transient errors (retriable raises and timeouts).
    pub fn new(policies: StagePolicies, reporter: Arc<dyn PipelineReporter>) -> Self {
        Self {
            policies,
            should_retry: Arc::new(InvocationError::is_transient),
            reporter,
        }
    }

    /// Replace the retry predicate.
    pub fn with_predicate(mut self, should_retry: RetryPredicate) -> Self {
        self.should_retry = should_retry;
        self
    }

    pub fn policies(&self) -> &StagePolicies {
        &self.policies
    }

    pub fn reporter(&self) -> &Arc<dyn PipelineReporter> {
        &self.reporter
    }

    /// Call `attempt` until it succeeds or the policy gives up.
    pub async fn invoke<T, F, Fut>(
        &self,
        ctx: InvocationContext<'_>,
        mut attempt: F,
    ) -> Result<Attempted<T>, ExtensionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InvocationError>>,
    {
        let extension = ctx.extension;
        let plugin = extension.plugin_name();
        let team_id = extension.config.team_id;
        let config_id = extension.config.id;
        let metric = ctx.category.metric_name();
        let reporter = self.reporter.as_ref();
        let policy = self.policies.for_category(ctx.category);

        let outcome = retry(policy, |e| (self.should_retry)(e), |n| {
            let call = attempt();
            async move {
                let started = Instant::now();
                let result = call.await;
                reporter.record_timing(metric, plugin, team_id, started.elapsed());
                if let Err(e) = &result {
                    debug!(
                        team_id,
                        config_id,
                        plugin = %plugin,
                        attempt = n,
                        error = %e,
                        "plugin attempt failed"
                    );
                }
                result
            }
        })
        .await;

        match outcome {
            Ok(attempted) => {
                if ctx.queue_app_metric {
                    reporter.queue_success(ctx.app_metric().success(attempted.attempts));
                }
                Ok(attempted)
            }
            Err(exhausted) => {
                let error = exhausted.error;
                reporter.increment(&format!("{metric}.ERROR"), plugin, team_id);
                reporter
                    .record_error(PluginErrorRecord {
                        team_id,
                        config_id,
                        plugin: plugin.to_string(),
                        category: ctx.category,
                        kind: error.kind().to_string(),
                        message: error.to_string(),
                        event: ctx.event.cloned(),
                        timestamp: Utc::now(),
                    })
                    .await;

                if ctx.queue_app_metric {
                    reporter.queue_failure(
                        ctx.app_metric().failure(),
                        ErrorDetail {
                            kind: error.kind().to_string(),
                            message: error.to_string(),
                            event: ctx.event.cloned(),
                        },
                    );
                }

                Err(ExtensionError {
                    team_id,
                    config_id,
                    plugin: plugin.to_string(),
                    category: ctx.category,
                    attempts: exhausted.attempts,
                    source: error,
                })
            }
        }
    }
}
