//! Ingestion test utilities.
//!
//! Helpers for integration testing: event fixtures, plugin config values
//! and assertion utilities for events leaving the pipeline.

use ingestion_sdk::types::PluginEvent;
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

/// Create a test event for `team_id` with a fresh UUID.
pub fn test_event(team_id: i64, event: &str) -> TestEvent {
    TestEvent {
        inner: PluginEvent::new(team_id, event, "distinct-1"),
    }
    .with_uuid(Uuid::now_v7())
}

/// A `$pageview` for `team_id` with a current URL.
pub fn pageview(team_id: i64, url: &str) -> PluginEvent {
    test_event(team_id, "$pageview")
        .with_property("$current_url", JsonValue::String(url.to_string()))
        .build()
}

/// An event builder for creating test fixtures.
#[derive(Debug, Clone)]
pub struct TestEvent {
    inner: PluginEvent,
}

impl TestEvent {
    /// Set the distinct id.
    pub fn with_distinct_id(mut self, distinct_id: &str) -> Self {
        self.inner.distinct_id = distinct_id.to_string();
        self
    }

    /// Set a custom UUID.
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.inner.uuid = Some(uuid);
        self
    }

    /// Set the client timestamp.
    pub fn with_timestamp(mut self, timestamp: &str) -> Self {
        self.inner.timestamp = Some(timestamp.to_string());
        self
    }

    /// Add a single property.
    pub fn with_property(mut self, name: &str, value: JsonValue) -> Self {
        self.inner.set_property(name, value);
        self
    }

    /// Mark plugins as already run, as on a replayed event.
    pub fn already_succeeded(self, identifiers: &[&str]) -> Self {
        self.with_property("$plugins_succeeded", string_array(identifiers))
    }

    /// Mark plugins as already failed, as on a replayed event.
    pub fn already_failed(self, identifiers: &[&str]) -> Self {
        self.with_property("$plugins_failed", string_array(identifiers))
    }

    /// Associate a group.
    pub fn with_group(mut self, group_type: &str, key: &str) -> Self {
        self.inner
            .groups
            .get_or_insert_with(Map::new)
            .insert(group_type.to_string(), JsonValue::String(key.to_string()));
        self
    }

    /// Finish building.
    pub fn build(self) -> PluginEvent {
        self.inner
    }
}

/// Plugin config values as stored per team.
pub fn plugin_config(pairs: &[(&str, &str)]) -> Map<String, JsonValue> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), JsonValue::String((*v).to_string())))
        .collect()
}

fn string_array(values: &[&str]) -> JsonValue {
    JsonValue::Array(
        values
            .iter()
            .map(|v| JsonValue::String((*v).to_string()))
            .collect(),
    )
}

/// Assertion helpers for JSON content.
pub mod assert {
    use ingestion_sdk::types::PluginEvent;
    use serde_json::Value;

    /// Assert that a JSON value has a specific key.
    pub fn has_key(value: &Value, key: &str) {
        assert!(
            value.get(key).is_some(),
            "Expected JSON to have key '{key}', got: {value}"
        );
    }

    /// Assert that a JSON value equals expected.
    pub fn json_eq(actual: &Value, expected: &Value) {
        assert_eq!(
            actual,
            expected,
            "JSON mismatch:\nactual: {}\nexpected: {}",
            serde_json::to_string_pretty(actual).unwrap_or_default(),
            serde_json::to_string_pretty(expected).unwrap_or_default()
        );
    }

    /// Assert the event carries exactly these identifiers under `marker`.
    pub fn markers(event: &PluginEvent, marker: &str, expected: &[&str]) {
        let actual = event.string_list(marker);
        assert_eq!(
            actual, expected,
            "marker '{marker}' mismatch on event '{}'",
            event.event
        );
    }

    /// Assert the event has no marker properties at all.
    pub fn no_markers(event: &PluginEvent) {
        for marker in ["$plugins_succeeded", "$plugins_failed", "$plugins_deferred"] {
            assert!(
                event.property(marker).is_none(),
                "Expected no '{marker}' on event, got: {:?}",
                event.property(marker)
            );
        }
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = test_event(2, "signup")
            .with_distinct_id("user-9")
            .with_property("plan", JsonValue::String("pro".into()))
            .with_group("company", "acme")
            .build();

        assert_eq!(event.team_id, 2);
        assert_eq!(event.distinct_id, "user-9");
        assert!(event.uuid.is_some());
        assert_eq!(event.property("plan"), Some(&JsonValue::String("pro".into())));
        assert_eq!(event.groups.unwrap()["company"], "acme");
    }

    #[test]
    fn test_replay_markers() {
        let event = test_event(1, "$pageview")
            .already_succeeded(&["geoip (4)"])
            .already_failed(&["filter (5)"])
            .build();

        assert::markers(&event, "$plugins_succeeded", &["geoip (4)"]);
        assert::markers(&event, "$plugins_failed", &["filter (5)"]);
    }

    #[test]
    fn test_pageview() {
        let event = pageview(3, "https://example.com/");
        assert_eq!(event.event, "$pageview");
        assert::no_markers(&event);
    }

    #[test]
    fn test_plugin_config() {
        let config = plugin_config(&[("property", "email"), ("mode", "drop")]);
        assert_eq!(config.len(), 2);
        assert::json_eq(&config["mode"], &JsonValue::String("drop".into()));
    }
}
