//! PostgreSQL plugin store.
//!
//! Reads configs, attachments, plugins and their source files from the
//! `posthog_plugin*` tables. The compiled module is stored base64-encoded in
//! `posthog_pluginsourcefile` under the file name `plugin.wasm`.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ingestion_sdk::types::Attachment;
use serde_json::{Map, Value, json};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::{AppMetricsSink, ConfigStore, ErrorStore, PluginErrorRecord, SourceStore};
use crate::metrics::AppMetricRow;
use crate::models::{
    ConfigId, DefinitionId, ExtensionConfig, ExtensionDefinition, SourceArtifacts, TeamId,
};

/// Source file holding the compiled module.
pub const WASM_FILE: &str = "plugin.wasm";

/// Source file holding the manifest.
pub const MANIFEST_FILE: &str = "plugin.json";

const CONFIG_COLUMNS: &str = r#"c.id::bigint AS id, c.team_id::bigint AS team_id,
    c.plugin_id::bigint AS plugin_id, c."order" AS "order", c.enabled, c.config"#;

#[derive(Debug, sqlx::FromRow)]
struct ConfigRow {
    id: i64,
    team_id: i64,
    plugin_id: i64,
    order: i32,
    enabled: bool,
    config: Option<Value>,
}

#[derive(Debug, sqlx::FromRow)]
struct AttachmentRow {
    plugin_config_id: i64,
    key: String,
    file_name: String,
    content_type: String,
    contents: Vec<u8>,
}

#[derive(Debug, sqlx::FromRow)]
struct PluginRow {
    id: i64,
    name: String,
    is_stateless: bool,
    disabled: bool,
    error: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct SourceFileRow {
    filename: String,
    source: Option<String>,
}

/// Plugin store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgPluginStore {
    pool: PgPool,
}

impl PgPluginStore {
    /// Create a new store with a database connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool of at most `max_connections` and wrap it.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to PostgreSQL")?;
        Ok(Self::new(pool))
    }

    /// Whether the database answers a trivial query.
    pub async fn check_health(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn attachments_for(
        &self,
        config_ids: &[ConfigId],
    ) -> Result<HashMap<ConfigId, BTreeMap<String, Attachment>>> {
        if config_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query_as::<_, AttachmentRow>(
            "SELECT plugin_config_id::bigint AS plugin_config_id, key, file_name, content_type, contents
             FROM posthog_pluginattachment WHERE plugin_config_id = ANY($1)",
        )
        .bind(config_ids)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch plugin attachments")?;

        Ok(group_attachments(rows))
    }

    async fn with_attachments(&self, rows: Vec<ConfigRow>) -> Result<Vec<ExtensionConfig>> {
        let ids: Vec<ConfigId> = rows.iter().map(|r| r.id).collect();
        let mut attachments = self.attachments_for(&ids).await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let files = attachments.remove(&row.id).unwrap_or_default();
                row.into_config(files)
            })
            .collect())
    }
}

impl ConfigRow {
    fn into_config(self, attachments: BTreeMap<String, Attachment>) -> ExtensionConfig {
        let config = match self.config {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        ExtensionConfig {
            id: self.id,
            team_id: self.team_id,
            definition_id: self.plugin_id,
            order: self.order,
            enabled: self.enabled,
            config,
            attachments,
        }
    }
}

fn group_attachments(rows: Vec<AttachmentRow>) -> HashMap<ConfigId, BTreeMap<String, Attachment>> {
    let mut grouped: HashMap<ConfigId, BTreeMap<String, Attachment>> = HashMap::new();
    for row in rows {
        grouped.entry(row.plugin_config_id).or_default().insert(
            row.key,
            Attachment {
                file_name: row.file_name,
                content_type: row.content_type,
                contents: row.contents,
            },
        );
    }
    grouped
}

/// Decode the base64 `plugin.wasm` source file.
fn decode_wasm(source: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(source.trim())
        .context("plugin.wasm source is not valid base64")
}

fn source_artifacts(files: Vec<SourceFileRow>) -> Result<SourceArtifacts> {
    let mut artifacts = SourceArtifacts::default();
    for file in files {
        let Some(source) = file.source else {
            continue;
        };
        match file.filename.as_str() {
            WASM_FILE => artifacts.wasm = decode_wasm(&source)?,
            MANIFEST_FILE => artifacts.manifest = Some(source),
            _ => {}
        }
    }
    Ok(artifacts)
}

#[async_trait]
impl ConfigStore for PgPluginStore {
    async fn fetch_enabled_configs(&self, team_id: TeamId) -> Result<Vec<ExtensionConfig>> {
        let rows = sqlx::query_as::<_, ConfigRow>(&format!(
            r#"SELECT {CONFIG_COLUMNS} FROM posthog_pluginconfig c
               WHERE c.team_id = $1 AND c.enabled = true AND c.deleted IS NOT TRUE
               ORDER BY c."order" ASC, c.id ASC"#
        ))
        .bind(team_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to fetch plugin configs for team {team_id}"))?;

        self.with_attachments(rows).await
    }

    async fn fetch_config(&self, config_id: ConfigId) -> Result<Option<ExtensionConfig>> {
        let row = sqlx::query_as::<_, ConfigRow>(&format!(
            r#"SELECT {CONFIG_COLUMNS} FROM posthog_pluginconfig c
               WHERE c.id = $1 AND c.enabled = true AND c.deleted IS NOT TRUE"#
        ))
        .bind(config_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to fetch plugin config {config_id}"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(self.with_attachments(vec![row]).await?.pop())
    }
}

#[async_trait]
impl SourceStore for PgPluginStore {
    async fn fetch_definition(&self, id: DefinitionId) -> Result<Option<ExtensionDefinition>> {
        let plugin = sqlx::query_as::<_, PluginRow>(
            "SELECT id::bigint AS id, name, COALESCE(is_stateless, false) AS is_stateless,
                    COALESCE(disabled, false) AS disabled, error::text AS error
             FROM posthog_plugin WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to fetch plugin {id}"))?;

        let Some(plugin) = plugin else {
            return Ok(None);
        };

        let files = sqlx::query_as::<_, SourceFileRow>(
            "SELECT filename, source FROM posthog_pluginsourcefile
             WHERE plugin_id = $1 AND filename = ANY($2)",
        )
        .bind(id)
        .bind([WASM_FILE, MANIFEST_FILE].as_slice())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to fetch source files for plugin {id}"))?;

        let source = source_artifacts(files)
            .with_context(|| format!("plugin '{}' has a corrupt source file", plugin.name))?;

        Ok(Some(ExtensionDefinition {
            id: plugin.id,
            name: plugin.name,
            stateless: plugin.is_stateless,
            disabled: plugin.disabled,
            error: plugin.error,
            source,
        }))
    }
}

#[async_trait]
impl ErrorStore for PgPluginStore {
    async fn record_plugin_error(&self, record: &PluginErrorRecord) -> Result<()> {
        let error = json!({
            "name": record.kind,
            "message": record.message,
            "time": record.timestamp.to_rfc3339(),
            "event": record.event,
        });

        sqlx::query("UPDATE posthog_pluginconfig SET error = $2 WHERE id = $1")
            .bind(record.config_id)
            .bind(error)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to record error for plugin config {}", record.config_id))?;

        Ok(())
    }
}

#[async_trait]
impl AppMetricsSink for PgPluginStore {
    async fn write_app_metrics(&self, rows: &[AppMetricRow]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to start app metrics transaction")?;

        for row in rows {
            sqlx::query(
                "INSERT INTO posthog_appmetrics
                   (timestamp, team_id, plugin_config_id, category, job_id, successes,
                    successes_on_retry, failures, error_uuid, error_type, error_details)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(row.timestamp)
            .bind(row.team_id)
            .bind(row.plugin_config_id)
            .bind(row.category.as_str())
            .bind(row.job_id.as_deref())
            .bind(row.successes as i64)
            .bind(row.successes_on_retry as i64)
            .bind(row.failures as i64)
            .bind(row.error_uuid)
            .bind(row.error_type.as_deref())
            .bind(row.error_details.as_ref())
            .execute(&mut *tx)
            .await
            .context("failed to insert app metric row")?;
        }

        tx.commit().await.context("failed to commit app metrics")?;
        Ok(())
    }
}
