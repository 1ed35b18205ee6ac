//! Core types exchanged between the kernel and plugins.
//!
//! Every entry point uses full serialization (JSON in, JSON out).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::protocol::{PLUGINS_DEFERRED, PLUGINS_FAILED, PLUGINS_SUCCEEDED};

/// An analytics event as seen by plugins.
///
/// The transform stage hands plugins the current value and takes back the
/// (possibly modified) event. `team_id` is owned by the kernel: a plugin that
/// changes it is reported and has the change reverted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    /// Tenant the event belongs to.
    pub team_id: i64,

    /// Event name (e.g. `$pageview`).
    pub event: String,

    /// Identifier of the subject that produced the event.
    pub distinct_id: String,

    /// ISO-8601 timestamp as sent by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// Event properties.
    #[serde(default)]
    pub properties: Map<String, Value>,

    /// Group associations (group type → group key).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Map<String, Value>>,

    /// Person properties to set.
    #[serde(default, rename = "$set", skip_serializing_if = "Option::is_none")]
    pub set: Option<Map<String, Value>>,

    /// Person properties to set only when absent.
    #[serde(
        default,
        rename = "$set_once",
        skip_serializing_if = "Option::is_none"
    )]
    pub set_once: Option<Map<String, Value>>,

    /// Client IP address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// Site the event originated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_url: Option<String>,

    /// Event UUID, when assigned upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
}

impl PluginEvent {
    /// Create a bare event with no properties.
    pub fn new(team_id: i64, event: impl Into<String>, distinct_id: impl Into<String>) -> Self {
        Self {
            team_id,
            event: event.into(),
            distinct_id: distinct_id.into(),
            timestamp: None,
            properties: Map::new(),
            groups: None,
            set: None,
            set_once: None,
            ip: None,
            site_url: None,
            uuid: None,
        }
    }

    /// Get a property value.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Set a property value, replacing any existing one.
    pub fn set_property(&mut self, key: impl Into<String>, value: Value) {
        self.properties.insert(key.into(), value);
    }

    /// Read a property holding an array of strings.
    ///
    /// Non-string entries are ignored; a missing or non-array property yields
    /// an empty list.
    pub fn string_list(&self, key: &str) -> Vec<String> {
        match self.properties.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Plugins that already succeeded on a previous attempt.
    pub fn plugins_succeeded(&self) -> Vec<String> {
        self.string_list(PLUGINS_SUCCEEDED)
    }

    /// Plugins that already failed on a previous attempt.
    pub fn plugins_failed(&self) -> Vec<String> {
        self.string_list(PLUGINS_FAILED)
    }

    /// Plugins deferred to the side-effect stage.
    pub fn plugins_deferred(&self) -> Vec<String> {
        self.string_list(PLUGINS_DEFERRED)
    }
}

/// An attachment bound to a plugin config (e.g. an uploaded database file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: String,
    pub contents: Vec<u8>,
}

/// Input handed to `setup_plugin` once per instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginSetup {
    /// Tenant config values.
    #[serde(default)]
    pub config: Map<String, Value>,

    /// Attachments keyed by config field.
    #[serde(default)]
    pub attachments: BTreeMap<String, Attachment>,
}

impl PluginSetup {
    /// Get a config value as a string.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_roundtrips_person_properties() {
        let raw = json!({
            "team_id": 2,
            "event": "$identify",
            "distinct_id": "abc",
            "$set": {"email": "a@example.com"},
            "properties": {"$browser": "Firefox"}
        });
        let event: PluginEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.team_id, 2);
        assert_eq!(event.set.as_ref().unwrap()["email"], "a@example.com");

        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back["$set"]["email"], "a@example.com");
        assert!(back.get("groups").is_none());
    }

    #[test]
    fn string_list_ignores_garbage() {
        let mut event = PluginEvent::new(1, "$pageview", "u1");
        event.set_property(PLUGINS_SUCCEEDED, json!(["geoip (3)", 4, null]));
        event.set_property(PLUGINS_FAILED, json!("not a list"));

        assert_eq!(event.plugins_succeeded(), vec!["geoip (3)".to_string()]);
        assert!(event.plugins_failed().is_empty());
        assert!(event.plugins_deferred().is_empty());
    }

    #[test]
    fn setup_reads_string_config() {
        let setup: PluginSetup =
            serde_json::from_value(json!({"config": {"prefix": "x_", "n": 3}})).unwrap();
        assert_eq!(setup.config_str("prefix"), Some("x_"));
        assert_eq!(setup.config_str("n"), None);
        assert!(setup.attachments.is_empty());
    }
}
