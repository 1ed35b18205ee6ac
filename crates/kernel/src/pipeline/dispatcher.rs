//! Event pipeline - runs a team's plugins over each event.
//!
//! The transform stage calls `process_event` in plugin order, threading the
//! event through each plugin. The side-effect stage calls `on_event` on every
//! plugin concurrently. Failures of one plugin are recorded and skipped,
//! allowing the others to continue.

use std::collections::HashSet;
use std::sync::Arc;

use ingestion_sdk::protocol::{PLUGINS_DEFERRED, PLUGINS_FAILED, PLUGINS_SUCCEEDED};
use ingestion_sdk::types::PluginEvent;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::invoke::{InvocationContext, Invoker};
use super::registry::TenantExtensionRegistry;
use crate::error::{ExtensionError, PipelineResult};
use crate::metrics::{MetricCategory, Metrics};
use crate::models::ConfigId;
use crate::plugin::{InvocationError, TaskType};

/// Result of the side-effect stage for one event.
#[derive(Debug, Default)]
pub struct OnEventSummary {
    /// Plugins whose `on_event` was called.
    pub invoked: usize,
    /// Identifiers of plugins that succeeded.
    pub succeeded: Vec<String>,
    pub failed: Vec<ExtensionError>,
}

/// Result of a task run.
#[derive(Debug)]
pub enum TaskOutcome {
    /// The config is gone or disabled; nothing ran.
    ConfigNotFound,
    /// The task ran and returned this value.
    Completed(Option<Value>),
    /// The task failed after exhausting its retry policy.
    Failed(ExtensionError),
}

/// Runs tenant plugins over events and tasks.
pub struct EventPipeline {
    registry: Arc<TenantExtensionRegistry>,
    invoker: Arc<Invoker>,
    metrics: Arc<Metrics>,
}

impl EventPipeline {
    pub fn new(
        registry: Arc<TenantExtensionRegistry>,
        invoker: Arc<Invoker>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            invoker,
            metrics,
        }
    }

    pub fn registry(&self) -> &TenantExtensionRegistry {
        &self.registry
    }

    /// Run the transform stage.
    ///
    /// Returns `None` if a plugin dropped the event. Plugins already listed
    /// in the event's succeeded or failed markers are skipped, so replays do
    /// not run them twice. Plugins with only `on_event` are recorded as
    /// deferred.
    pub async fn run_process_event(&self, event: PluginEvent) -> PipelineResult<Option<PluginEvent>> {
        let team_id = event.team_id;
        let team = self.registry.get_active_configs(team_id).await?;

        let mut succeeded = event.plugins_succeeded();
        let mut failed = event.plugins_failed();
        let already_processed: HashSet<String> =
            succeeded.iter().chain(failed.iter()).cloned().collect();
        let mut event = event;

        for extension in team.iter() {
            if extension.handle.methods().process_event.is_none() {
                continue;
            }
            let identifier = extension.identifier();
            if already_processed.contains(&identifier) {
                debug!(team_id, plugin = %identifier, "skipping already processed plugin");
                continue;
            }

            let handle = &extension.handle;
            let current = &event;
            let ctx = InvocationContext::new(extension, MetricCategory::ProcessEvent)
                .with_event(current);

            let result = self
                .invoker
                .invoke(ctx, move || handle.process_event(current))
                .await;
            match result {
                Ok(attempted) => match attempted.value {
                    Some(next) => {
                        event = next;
                        succeeded.push(identifier);
                    }
                    None => {
                        self.metrics.events_dropped.inc();
                        debug!(team_id, plugin = %identifier, "event dropped by plugin");
                        return Ok(None);
                    }
                },
                Err(e) => {
                    if let InvocationError::IllegalOperation { event: corrected, .. } = e.source {
                        event = *corrected;
                    }
                    failed.push(identifier);
                }
            }
        }

        let deferred: Vec<String> = team
            .iter()
            .filter(|e| e.handle.methods().is_side_effect_only())
            .map(|e| e.identifier())
            .collect();

        if !(succeeded.is_empty() && failed.is_empty() && deferred.is_empty()) {
            event.set_property(PLUGINS_SUCCEEDED, string_array(succeeded));
            event.set_property(PLUGINS_FAILED, string_array(failed));
            event.set_property(PLUGINS_DEFERRED, string_array(deferred));
        }

        Ok(Some(event))
    }

    /// Run the side-effect stage: every `on_event`, concurrently.
    ///
    /// Each call has its own retries and outcome; one failure never affects
    /// another.
    pub async fn run_on_event(&self, event: &PluginEvent) -> PipelineResult<OnEventSummary> {
        let team = self.registry.get_active_configs(event.team_id).await?;
        let event = Arc::new(event.clone());

        let mut calls = JoinSet::new();
        for extension in team.iter() {
            if extension.handle.methods().on_event.is_none() {
                continue;
            }

            let extension = extension.clone();
            let invoker = Arc::clone(&self.invoker);
            let event = Arc::clone(&event);
            calls.spawn(async move {
                let identifier = extension.identifier();
                let handle = &extension.handle;
                let input = event.as_ref();
                let ctx =
                    InvocationContext::new(&extension, MetricCategory::OnEvent).with_event(input);
                let result = invoker.invoke(ctx, move || handle.on_event(input)).await;
                (identifier, result.map(|_| ()))
            });
        }

        let mut summary = OnEventSummary {
            invoked: calls.len(),
            ..OnEventSummary::default()
        };

        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((identifier, Ok(()))) => summary.succeeded.push(identifier),
                Ok((_, Err(e))) => summary.failed.push(e),
                Err(e) => error!(team_id = event.team_id, error = %e, "on_event task panicked"),
            }
        }

        Ok(summary)
    }

    /// Run a named task of one plugin config.
    ///
    /// A config that no longer resolves is skipped. A missing task is a
    /// failure. Only `Schedule` tasks queue an app metric, unless the
    /// manifest opts the task out.
    pub async fn run_plugin_task(
        &self,
        config_id: ConfigId,
        task_name: &str,
        task_type: TaskType,
        payload: Option<Value>,
    ) -> PipelineResult<TaskOutcome> {
        let Some(extension) = self.registry.get_config(config_id).await? else {
            info!(
                config_id,
                task = %task_name,
                task_type = %task_type,
                "plugin config not found, skipping task"
            );
            return Ok(TaskOutcome::ConfigNotFound);
        };

        let task = extension.handle.methods().task(task_name, task_type);
        let queue_app_metric = task_type == TaskType::Schedule
            && !task.is_some_and(|t| t.ignore_for_app_metrics);

        let handle = &extension.handle;
        let payload = payload.as_ref();
        let ctx = InvocationContext::new(&extension, MetricCategory::ScheduledTask)
            .with_job(task_name)
            .queue_app_metric(queue_app_metric);

        let result = self
            .invoker
            .invoke(ctx, move || async move {
                match task {
                    Some(task) => handle.run_task(task, payload).await,
                    None => Err(InvocationError::MissingEntryPoint {
                        name: task_name.to_string(),
                    }),
                }
            })
            .await;

        Ok(match result {
            Ok(attempted) => TaskOutcome::Completed(attempted.value),
            Err(e) => TaskOutcome::Failed(e),
        })
    }
}

fn string_array(values: Vec<String>) -> Value {
    Value::Array(values.into_iter().map(Value::String).collect())
}
