//! Tenant registry and handle cache integration tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, Script, fast_settings};
use ingestion_kernel::PipelineError;
use ingestion_kernel::plugin::{HandleKey, PluginError};
use ingestion_kernel::store::MemoryPluginStore;
use ingestion_test_utils::plugin_config;
use serde_json::json;
use tokio::task::JoinSet;

#[tokio::test]
async fn concurrent_lookups_share_one_store_query() {
    let h = Harness::with_store(
        MemoryPluginStore::new().with_latency(Duration::from_millis(50)),
        fast_settings(),
    );
    h.plugin(1, "a", Script::new().passthrough());
    h.config(10, 7, 1, 1);

    let mut lookups = JoinSet::new();
    for _ in 0..16 {
        let services = h.services.clone();
        lookups.spawn(async move { services.registry().get_active_configs(7).await });
    }
    let results: Vec<_> = lookups.join_all().await;

    assert_eq!(h.store.team_queries(), 1);
    assert_eq!(h.sandbox.instantiations(), 1);
    let first = results[0].as_ref().unwrap();
    for team in &results {
        assert!(Arc::ptr_eq(first, team.as_ref().unwrap()));
    }
}

#[tokio::test]
async fn cached_team_does_not_query_again() {
    let h = Harness::new();
    h.plugin(1, "a", Script::new().passthrough());
    h.config(10, 7, 1, 1);

    let registry = h.services.registry();
    registry.get_active_configs(7).await.unwrap();
    registry.get_active_configs(7).await.unwrap();

    assert_eq!(h.store.team_queries(), 1);
    assert_eq!(h.store.definition_queries(), 1);
}

#[tokio::test]
async fn list_is_ordered_and_enabled_only() {
    let h = Harness::new();
    h.plugin(1, "a", Script::new().passthrough());
    h.config(10, 7, 1, 5);
    h.config(11, 7, 1, -1);
    h.config(12, 7, 1, 3);
    h.config(13, 7, 1, 0);
    h.store.set_config_enabled(12, false);

    let team = h.services.registry().get_active_configs(7).await.unwrap();
    let ids: Vec<i64> = team.iter().map(|e| e.config.id).collect();
    assert_eq!(ids, [11, 13, 10]);
}

#[tokio::test]
async fn stateless_handle_is_shared_between_teams() {
    let h = Harness::new();
    h.stateless_plugin(1, "geoip", Script::new().passthrough());
    h.config(10, 1, 1, 1);
    h.config(20, 2, 1, 1);

    let registry = h.services.registry();
    let one = registry.get_active_configs(1).await.unwrap();
    let two = registry.get_active_configs(2).await.unwrap();

    let a = &one.extensions[0].handle;
    let b = &two.extensions[0].handle;
    assert!(Arc::ptr_eq(a, b));
    assert_eq!(a.key(), HandleKey::Shared(1));
    assert_eq!(h.sandbox.instantiations(), 1);
}

#[tokio::test]
async fn stateful_handles_are_per_config() {
    let h = Harness::new();
    h.plugin(1, "counter", Script::new().passthrough());
    h.config(10, 1, 1, 1);
    h.config(20, 2, 1, 1);

    let registry = h.services.registry();
    let one = registry.get_active_configs(1).await.unwrap();
    let two = registry.get_active_configs(2).await.unwrap();

    assert!(!Arc::ptr_eq(&one.extensions[0].handle, &two.extensions[0].handle));
    assert_eq!(h.sandbox.instantiations(), 2);
}

#[tokio::test]
async fn failed_instantiation_is_not_cached() {
    let h = Harness::new();
    h.plugin(1, "a", Script::new().passthrough());
    h.config(10, 7, 1, 1);
    h.sandbox.fail_next(1);

    let registry = h.services.registry();
    let err = registry.get_active_configs(7).await.unwrap_err();
    assert!(matches!(
        err.root(),
        PipelineError::Instantiation(PluginError::InstantiationFailed { .. })
    ));

    let team = registry.get_active_configs(7).await.unwrap();
    assert_eq!(team.len(), 1);
    assert_eq!(h.sandbox.instantiations(), 1);
    assert_eq!(h.store.team_queries(), 2);
}

#[tokio::test]
async fn missing_and_disabled_definitions_are_skipped() {
    let h = Harness::new();
    h.plugin(1, "ok", Script::new().passthrough());
    h.plugin(2, "off", Script::new().passthrough());
    h.store.insert_definition(ingestion_kernel::models::ExtensionDefinition {
        id: 2,
        name: "off".into(),
        stateless: false,
        disabled: true,
        error: None,
        source: Default::default(),
    });
    h.config(10, 7, 1, 1);
    h.config(20, 7, 2, 2);
    h.config(30, 7, 99, 3);

    let team = h.services.registry().get_active_configs(7).await.unwrap();
    let ids: Vec<i64> = team.iter().map(|e| e.config.id).collect();
    assert_eq!(ids, [10]);
    assert!(team.definition_ids.contains(&2));
    assert!(team.definition_ids.contains(&99));
}

#[tokio::test]
async fn missing_required_config_fails_setup() {
    let h = Harness::new();
    h.plugin(
        1,
        "filter",
        Script::new().passthrough().with_manifest(json!({
            "name": "filter",
            "config": [{ "key": "property", "required": true }]
        })),
    );
    h.config(10, 7, 1, 1);
    h.config_with(20, 8, 1, 1, plugin_config(&[("property", "email")]));

    let err = h.services.registry().get_active_configs(7).await.unwrap_err();
    assert!(matches!(
        err.root(),
        PipelineError::Instantiation(PluginError::MissingConfig { .. })
    ));

    let team = h.services.registry().get_active_configs(8).await.unwrap();
    assert_eq!(team.len(), 1);
}

#[tokio::test]
async fn point_lookup_resolves_single_config() {
    let h = Harness::new();
    h.plugin(1, "a", Script::new().passthrough());
    h.config(10, 7, 1, 1);

    let registry = h.services.registry();
    let loaded = registry.get_config(10).await.unwrap().expect("config 10");
    assert_eq!(loaded.config.team_id, 7);
    assert_eq!(loaded.identifier(), "a (10)");

    assert!(registry.get_config(404).await.unwrap().is_none());
    registry.get_config(404).await.unwrap();
    assert_eq!(h.store.config_queries(), 2);
}
