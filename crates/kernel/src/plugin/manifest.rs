//! Parser for plugin `plugin.json` manifests.
//!
//! A manifest declares metadata:
//! - name, version, description
//! - config fields (required flags and defaults)
//! - tasks (on-demand jobs and scheduled tasks the plugin implements)

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use ingestion_sdk::protocol::SCHEDULED_TASKS;

/// Plugin metadata parsed from `plugin.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginManifest {
    /// Plugin machine name.
    pub name: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Semantic version (e.g., "1.0.0").
    #[serde(default)]
    pub version: Option<String>,

    /// Config fields the team fills in.
    #[serde(default)]
    pub config: Vec<ConfigField>,

    /// Task options keyed by task name.
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskOptions>,
}

/// One config field.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigField {
    pub key: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub default: Option<Value>,
}

/// Per-task options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskOptions {
    /// Task runs are not reported as app metrics.
    #[serde(default, rename = "__ignoreForAppMetrics", alias = "ignore_for_app_metrics")]
    pub ignore_for_app_metrics: bool,
}

impl PluginManifest {
    /// Parse a manifest from a JSON string.
    pub fn parse_str(content: &str) -> Result<Self> {
        let manifest: PluginManifest =
            serde_json::from_str(content).context("failed to parse plugin.json")?;

        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("plugin.json has empty 'name' field");
        }

        for field in &self.config {
            if field.key.is_empty() {
                anyhow::bail!("plugin '{}' declares a config field with empty 'key'", self.name);
            }
        }

        Ok(())
    }

    /// Whether runs of `task` should skip app metrics.
    pub fn ignores_app_metrics(&self, task: &str) -> bool {
        self.tasks
            .get(task)
            .is_some_and(|options| options.ignore_for_app_metrics)
    }

    /// On-demand job names: every declared task that isn't a scheduled one.
    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.tasks
            .keys()
            .map(String::as_str)
            .filter(|name| !SCHEDULED_TASKS.iter().any(|(task, _)| task == name))
    }

    /// First required field with no value and no default.
    pub fn missing_required(&self, config: &Map<String, Value>) -> Option<&str> {
        self.config
            .iter()
            .filter(|field| field.required && field.default.is_none())
            .find(|field| config.get(&field.key).is_none_or(is_blank))
            .map(|field| field.key.as_str())
    }

    /// Fill unset fields from their declared defaults.
    pub fn apply_defaults(&self, config: &mut Map<String, Value>) {
        for field in &self.config {
            let Some(default) = &field.default else {
                continue;
            };
            if config.get(&field.key).is_none_or(is_blank) {
                config.insert(field.key.clone(), default.clone());
            }
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_valid_manifest() {
        let json = r#"{
            "name": "geoip",
            "description": "Enrich events with location",
            "version": "1.0.0",
            "config": [
                {"key": "apiKey", "required": true},
                {"key": "precision", "default": "city"}
            ],
            "tasks": {
                "refreshDatabase": {},
                "runEveryHour": {"__ignoreForAppMetrics": true}
            }
        }"#;

        let manifest = PluginManifest::parse_str(json).unwrap();
        assert_eq!(manifest.name, "geoip");
        assert_eq!(manifest.version.as_deref(), Some("1.0.0"));
        assert_eq!(manifest.config.len(), 2);
        assert!(manifest.ignores_app_metrics("runEveryHour"));
        assert!(!manifest.ignores_app_metrics("refreshDatabase"));
        assert_eq!(manifest.job_names().collect::<Vec<_>>(), vec!["refreshDatabase"]);
    }

    #[test]
    fn parse_minimal_manifest() {
        let manifest = PluginManifest::parse_str(r#"{"name": "minimal"}"#).unwrap();
        assert!(manifest.config.is_empty());
        assert!(manifest.tasks.is_empty());
        assert_eq!(manifest.job_names().count(), 0);
    }

    #[test]
    fn reject_empty_name() {
        let result = PluginManifest::parse_str(r#"{"name": ""}"#);
        assert!(result.unwrap_err().to_string().contains("empty 'name'"));
    }

    #[test]
    fn reject_malformed_json() {
        assert!(PluginManifest::parse_str("{name").is_err());
    }

    #[test]
    fn required_fields_and_defaults() {
        let manifest = PluginManifest::parse_str(
            r#"{"name": "geoip", "config": [
                {"key": "apiKey", "required": true},
                {"key": "precision", "required": true, "default": "city"}
            ]}"#,
        )
        .unwrap();

        let mut config = Map::new();
        assert_eq!(manifest.missing_required(&config), Some("apiKey"));

        config.insert("apiKey".into(), json!(""));
        assert_eq!(manifest.missing_required(&config), Some("apiKey"));

        config.insert("apiKey".into(), json!("k"));
        assert_eq!(manifest.missing_required(&config), None);

        manifest.apply_defaults(&mut config);
        assert_eq!(config["precision"], json!("city"));
        assert_eq!(config["apiKey"], json!("k"));
    }
}
