//! Storage collaborators for the plugin pipeline.
//!
//! The pipeline reads tenant configuration and plugin source through these
//! traits and writes errors and app metrics back through them. The Postgres
//! implementation is used in production; the in-memory one backs tests and
//! local runs.

mod memory;
mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingestion_sdk::types::PluginEvent;

use crate::metrics::{AppMetricRow, MetricCategory};
use crate::models::{ConfigId, DefinitionId, ExtensionConfig, ExtensionDefinition, TeamId};

pub use memory::MemoryPluginStore;
pub use postgres::PgPluginStore;

/// Tenant plugin configuration.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Enabled configs for a team, ordered by `order` ascending.
    async fn fetch_enabled_configs(&self, team_id: TeamId) -> Result<Vec<ExtensionConfig>>;

    /// A single config by id.
    ///
    /// Returns `None` if the config doesn't exist or is disabled.
    async fn fetch_config(&self, config_id: ConfigId) -> Result<Option<ExtensionConfig>>;
}

/// Plugin definitions and their source artifacts.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Returns `None` if the definition doesn't exist.
    async fn fetch_definition(&self, id: DefinitionId) -> Result<Option<ExtensionDefinition>>;
}

/// A plugin failure, as persisted for the team to inspect.
#[derive(Debug, Clone)]
pub struct PluginErrorRecord {
    pub team_id: TeamId,
    pub config_id: ConfigId,
    pub plugin: String,
    pub category: MetricCategory,
    /// Error kind, e.g. `Timeout` or `IllegalOperation`.
    pub kind: String,
    pub message: String,
    /// The event being processed, if any.
    pub event: Option<PluginEvent>,
    pub timestamp: DateTime<Utc>,
}

/// Destination for plugin error reports.
#[async_trait]
pub trait ErrorStore: Send + Sync {
    async fn record_plugin_error(&self, record: &PluginErrorRecord) -> Result<()>;
}

/// Destination for flushed app metrics.
#[async_trait]
pub trait AppMetricsSink: Send + Sync {
    async fn write_app_metrics(&self, rows: &[AppMetricRow]) -> Result<()>;
}

/// Everything the pipeline needs from storage.
pub trait PluginStore: ConfigStore + SourceStore + ErrorStore + AppMetricsSink {}

impl<T: ConfigStore + SourceStore + ErrorStore + AppMetricsSink> PluginStore for T {}
