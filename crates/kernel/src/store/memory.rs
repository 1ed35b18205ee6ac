//! In-memory plugin store.
//!
//! Backs tests and local runs. Counts queries so callers can assert how often
//! the caches went to storage, and can simulate latency or an outage.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{AppMetricsSink, ConfigStore, ErrorStore, PluginErrorRecord, SourceStore};
use crate::metrics::AppMetricRow;
use crate::models::{ConfigId, DefinitionId, ExtensionConfig, ExtensionDefinition, TeamId};

/// Plugin store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryPluginStore {
    definitions: DashMap<DefinitionId, ExtensionDefinition>,
    configs: DashMap<ConfigId, ExtensionConfig>,
    errors: Mutex<Vec<PluginErrorRecord>>,
    app_metrics: Mutex<Vec<AppMetricRow>>,
    team_queries: AtomicUsize,
    config_queries: AtomicUsize,
    definition_queries: AtomicUsize,
    unavailable: AtomicBool,
    latency: Option<Duration>,
}

impl MemoryPluginStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every read by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert_definition(&self, definition: ExtensionDefinition) {
        self.definitions.insert(definition.id, definition);
    }

    pub fn insert_config(&self, config: ExtensionConfig) {
        self.configs.insert(config.id, config);
    }

    pub fn remove_config(&self, config_id: ConfigId) -> Option<ExtensionConfig> {
        self.configs.remove(&config_id).map(|(_, config)| config)
    }

    /// Enable or disable a config in place.
    pub fn set_config_enabled(&self, config_id: ConfigId, enabled: bool) {
        if let Some(mut config) = self.configs.get_mut(&config_id) {
            config.enabled = enabled;
        }
    }

    /// Make every read fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `fetch_enabled_configs` calls.
    pub fn team_queries(&self) -> usize {
        self.team_queries.load(Ordering::SeqCst)
    }

    /// Number of `fetch_config` calls.
    pub fn config_queries(&self) -> usize {
        self.config_queries.load(Ordering::SeqCst)
    }

    /// Number of `fetch_definition` calls.
    pub fn definition_queries(&self) -> usize {
        self.definition_queries.load(Ordering::SeqCst)
    }

    pub fn plugin_errors(&self) -> Vec<PluginErrorRecord> {
        self.errors.lock().clone()
    }

    pub fn app_metric_rows(&self) -> Vec<AppMetricRow> {
        self.app_metrics.lock().clone()
    }

    async fn before_read(&self, counter: &AtomicUsize) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("plugin store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryPluginStore {
    async fn fetch_enabled_configs(&self, team_id: TeamId) -> Result<Vec<ExtensionConfig>> {
        self.before_read(&self.team_queries).await?;

        let mut configs: Vec<ExtensionConfig> = self
            .configs
            .iter()
            .filter(|c| c.team_id == team_id && c.enabled)
            .map(|c| c.value().clone())
            .collect();
        configs.sort_by_key(|c| (c.order, c.id));
        Ok(configs)
    }

    async fn fetch_config(&self, config_id: ConfigId) -> Result<Option<ExtensionConfig>> {
        self.before_read(&self.config_queries).await?;

        Ok(self
            .configs
            .get(&config_id)
            .filter(|c| c.enabled)
            .map(|c| c.value().clone()))
    }
}

#[async_trait]
impl SourceStore for MemoryPluginStore {
    async fn fetch_definition(&self, id: DefinitionId) -> Result<Option<ExtensionDefinition>> {
        self.before_read(&self.definition_queries).await?;
        Ok(self.definitions.get(&id).map(|d| d.value().clone()))
    }
}

#[async_trait]
impl ErrorStore for MemoryPluginStore {
    async fn record_plugin_error(&self, record: &PluginErrorRecord) -> Result<()> {
        self.errors.lock().push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl AppMetricsSink for MemoryPluginStore {
    async fn write_app_metrics(&self, rows: &[AppMetricRow]) -> Result<()> {
        self.app_metrics.lock().extend_from_slice(rows);
        Ok(())
    }
}
