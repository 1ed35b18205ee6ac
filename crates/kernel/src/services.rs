//! Plugin services shared by the worker.
//!
//! Owns the registry, handle cache, invoker and metrics for one process.
//! Built at startup, invalidated by reload signals, torn down with
//! [`PluginServices::shutdown`].

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::PipelineSettings;
use crate::metrics::{AppMetrics, Metrics, PipelineReporter, Reporter};
use crate::pipeline::{EventPipeline, Invoker, TenantExtensionRegistry};
use crate::plugin::{ExtensionHandleCache, HandleKey, Sandbox, WorkerPool};
use crate::reload::ReloadSignal;
use crate::store::{AppMetricsSink, ConfigStore, ErrorStore, PluginStore, SourceStore};

/// Shared plugin services.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct PluginServices {
    inner: Arc<PluginServicesInner>,
}

struct PluginServicesInner {
    settings: PipelineSettings,
    metrics: Arc<Metrics>,
    app_metrics: Arc<AppMetrics>,
    sink: Arc<dyn AppMetricsSink>,
    pool: Arc<WorkerPool>,
    handles: Arc<ExtensionHandleCache>,
    registry: Arc<TenantExtensionRegistry>,
    pipeline: EventPipeline,
}

impl PluginServices {
    /// Wire the services over `store` and `sandbox`.
    pub fn new<S>(settings: PipelineSettings, store: Arc<S>, sandbox: Arc<dyn Sandbox>) -> Self
    where
        S: PluginStore + 'static,
    {
        let metrics = Arc::new(Metrics::new());
        let app_metrics = Arc::new(AppMetrics::new());
        let errors: Arc<dyn ErrorStore> = store.clone();
        let reporter: Arc<dyn PipelineReporter> = Arc::new(Reporter::new(
            Arc::clone(&metrics),
            Arc::clone(&app_metrics),
            errors,
        ));

        Self::with_reporter(settings, store, sandbox, metrics, app_metrics, reporter)
    }

    /// Wire the services with a custom reporter.
    pub fn with_reporter<S>(
        settings: PipelineSettings,
        store: Arc<S>,
        sandbox: Arc<dyn Sandbox>,
        metrics: Arc<Metrics>,
        app_metrics: Arc<AppMetrics>,
        reporter: Arc<dyn PipelineReporter>,
    ) -> Self
    where
        S: PluginStore + 'static,
    {
        let configs: Arc<dyn ConfigStore> = store.clone();
        let sources: Arc<dyn SourceStore> = store.clone();
        let sink: Arc<dyn AppMetricsSink> = store;

        let pool = Arc::new(WorkerPool::new(settings.worker_concurrency, settings.timeout));
        let handles = Arc::new(ExtensionHandleCache::new(
            sources,
            sandbox,
            Arc::clone(&pool),
            Arc::clone(&metrics),
        ));
        let registry = Arc::new(TenantExtensionRegistry::new(
            configs,
            Arc::clone(&handles),
            Arc::clone(&metrics),
            settings.team_cache_capacity,
        ));
        let invoker = Arc::new(Invoker::new(settings.stage_policies(), reporter));
        let pipeline = EventPipeline::new(
            Arc::clone(&registry),
            invoker,
            Arc::clone(&metrics),
        );

        Self {
            inner: Arc::new(PluginServicesInner {
                settings,
                metrics,
                app_metrics,
                sink,
                pool,
                handles,
                registry,
                pipeline,
            }),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    pub fn pipeline(&self) -> &EventPipeline {
        &self.inner.pipeline
    }

    pub fn registry(&self) -> &TenantExtensionRegistry {
        &self.inner.registry
    }

    pub fn handles(&self) -> &ExtensionHandleCache {
        &self.inner.handles
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn app_metrics(&self) -> &Arc<AppMetrics> {
        &self.inner.app_metrics
    }

    /// Start the periodic app-metrics flush; flushes once more on stop.
    pub fn spawn_app_metrics_flusher(&self, stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        self.inner.app_metrics.spawn_flusher(
            Arc::clone(&self.inner.sink),
            self.inner.settings.app_metrics_flush,
            stop_rx,
        )
    }

    /// Write queued app metrics now.
    pub async fn flush_app_metrics(&self) -> anyhow::Result<usize> {
        self.inner.app_metrics.flush(self.inner.sink.as_ref()).await
    }

    /// Drop cached state affected by `signal` and dispose stale handles.
    ///
    /// Registry entries are dropped before their handles are disposed.
    pub async fn apply_reload(&self, signal: ReloadSignal) {
        let registry = &self.inner.registry;
        let handles = &self.inner.handles;

        let disposed = match signal {
            ReloadSignal::Definition(id) => {
                let teams = registry.invalidate_definition(id).await;
                info!(definition_id = id, teams = teams.len(), "plugin definition reloaded");
                handles.dispose_definition(id).await
            }
            ReloadSignal::Team(team_id) => {
                let configs = registry.invalidate_team(team_id).await;

                let mut disposed = 0;
                for config_id in configs {
                    if handles.dispose(HandleKey::Config(config_id)).await {
                        disposed += 1;
                    }
                }
                disposed
            }
            ReloadSignal::Config(config_id) => {
                let teams = registry.invalidate_config(config_id).await;
                debug!(config_id, teams = ?teams, "plugin config reloaded");
                usize::from(handles.dispose(HandleKey::Config(config_id)).await)
            }
            ReloadSignal::All => {
                registry.invalidate_all();
                handles.dispose_all().await
            }
        };

        self.inner.metrics.record_reload(signal.kind());
        info!(signal = %signal, disposed, "applied plugin reload");
    }

    /// Dispose every handle and refuse further plugin calls.
    pub async fn shutdown(&self) {
        self.inner.registry.invalidate_all();
        let disposed = self.inner.handles.dispose_all().await;
        self.inner.pool.close();
        info!(disposed, "plugin services shut down");
    }
}
