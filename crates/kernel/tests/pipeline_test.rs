//! Event pipeline integration tests.
//!
//! Run the transform and side-effect stages against real registry, cache,
//! invoker and reporter with scripted plugins.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::{Harness, Script, raised};
use ingestion_kernel::metrics::MetricCategory;
use ingestion_kernel::plugin::InvocationError;
use ingestion_test_utils::{assert, pageview, test_event};
use serde_json::json;
use tokio::sync::Barrier;

const TEAM: i64 = 2;

fn tag(name: &'static str) -> Script {
    Script::new().process_event(move |mut event| {
        event.set_property(name, json!(true));
        Ok(Some(event))
    })
}

#[tokio::test]
async fn transform_runs_in_ascending_order() {
    let h = Harness::new();
    h.plugin(1, "a", tag("a"));
    h.plugin(2, "b", tag("b"));
    h.plugin(3, "c", tag("c"));
    h.config(30, TEAM, 3, 3);
    h.config(10, TEAM, 1, 1);
    h.config(20, TEAM, 2, 2);

    let event = h
        .pipeline()
        .run_process_event(pageview(TEAM, "https://example.com"))
        .await
        .unwrap()
        .expect("event kept");

    assert_eq!(h.sandbox.calls_to("process_event"), ["a", "b", "c"]);
    assert::markers(&event, "$plugins_succeeded", &["a (10)", "b (20)", "c (30)"]);
    assert::markers(&event, "$plugins_failed", &[]);
    for name in ["a", "b", "c"] {
        assert_eq!(event.property(name), Some(&json!(true)));
    }
}

#[tokio::test]
async fn dropped_event_halts_later_plugins() {
    let h = Harness::new();
    h.plugin(1, "a", tag("a"));
    h.plugin(2, "dropper", Script::new().process_event(|_| Ok(None)));
    h.plugin(3, "c", tag("c"));
    h.config(10, TEAM, 1, 1);
    h.config(20, TEAM, 2, 2);
    h.config(30, TEAM, 3, 3);

    let result = h
        .pipeline()
        .run_process_event(pageview(TEAM, "https://example.com"))
        .await
        .unwrap();

    assert!(result.is_none());
    assert_eq!(h.sandbox.calls_to("process_event"), ["a", "dropper"]);
    assert_eq!(h.services.metrics().events_dropped.get(), 1);
    assert!(h.store.plugin_errors().is_empty());
}

#[tokio::test]
async fn transform_then_side_effect_example() {
    let h = Harness::new();
    h.plugin(1, "a", Script::new().passthrough());
    h.plugin(2, "b", Script::new().passthrough().on_event_ok());
    h.plugin(3, "c", Script::new().on_event_ok());
    h.config(1, TEAM, 1, 1);
    h.config(2, TEAM, 2, 2);
    h.config(3, TEAM, 3, 3);

    let event = h
        .pipeline()
        .run_process_event(pageview(TEAM, "https://example.com"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.sandbox.calls_to("process_event"), ["a", "b"]);
    assert!(h.sandbox.calls_to("on_event").is_empty());
    assert::markers(&event, "$plugins_succeeded", &["a (1)", "b (2)"]);
    assert::markers(&event, "$plugins_deferred", &["c (3)"]);
    assert::markers(&event, "$plugins_failed", &[]);

    let summary = h.pipeline().run_on_event(&event).await.unwrap();
    assert_eq!(summary.invoked, 2);
    assert!(summary.failed.is_empty());

    let mut on_event = h.sandbox.calls_to("on_event");
    on_event.sort();
    assert_eq!(on_event, ["b", "c"]);
}

#[tokio::test]
async fn team_without_plugins_gets_no_markers() {
    let h = Harness::new();
    let input = pageview(TEAM, "https://example.com");

    let event = h
        .pipeline()
        .run_process_event(input.clone())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(event, input);
    assert::no_markers(&event);
    assert_eq!(h.pipeline().run_on_event(&event).await.unwrap().invoked, 0);
}

#[tokio::test]
async fn team_id_change_is_reverted_and_marked_failed() {
    let h = Harness::new();
    h.plugin(
        1,
        "hijack",
        Script::new().process_event(|mut event| {
            event.team_id = 999;
            event.set_property("hijacked", json!(true));
            Ok(Some(event))
        }),
    );
    h.plugin(2, "after", tag("after"));
    h.config(10, TEAM, 1, 1);
    h.config(20, TEAM, 2, 2);

    let event = h
        .pipeline()
        .run_process_event(pageview(TEAM, "https://example.com"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(event.team_id, TEAM);
    assert_eq!(event.property("hijacked"), Some(&json!(true)));
    assert_eq!(event.property("after"), Some(&json!(true)));
    assert::markers(&event, "$plugins_failed", &["hijack (10)"]);
    assert::markers(&event, "$plugins_succeeded", &["after (20)"]);

    let errors = h.store.plugin_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, "IllegalOperation");
    assert_eq!(errors[0].config_id, 10);
}

#[tokio::test]
async fn failed_transform_still_forwards_event() {
    let h = Harness::new();
    h.plugin(
        1,
        "broken",
        Script::new().process_event(|_| Err(raised("cannot parse", false))),
    );
    h.plugin(2, "after", tag("after"));
    h.config(10, TEAM, 1, 1);
    h.config(20, TEAM, 2, 2);

    let event = h
        .pipeline()
        .run_process_event(pageview(TEAM, "https://example.com"))
        .await
        .unwrap()
        .expect("failures never drop the event");

    assert::markers(&event, "$plugins_failed", &["broken (10)"]);
    assert::markers(&event, "$plugins_succeeded", &["after (20)"]);
    assert_eq!(
        h.services
            .metrics()
            .count("plugin.process_event.ERROR", "broken", TEAM),
        1
    );

    let rows = h.app_metric_rows().await;
    let failure = rows
        .iter()
        .find(|r| r.plugin_config_id == 10)
        .expect("failure row");
    assert_eq!(failure.category, MetricCategory::ProcessEvent);
    assert_eq!(failure.failures, 1);
    assert_eq!(failure.error_type.as_deref(), Some("PluginError"));
}

#[tokio::test]
async fn replayed_event_skips_already_processed_plugins() {
    let h = Harness::new();
    h.plugin(1, "a", tag("a"));
    h.plugin(2, "b", tag("b"));
    h.plugin(3, "c", tag("c"));
    h.config(10, TEAM, 1, 1);
    h.config(20, TEAM, 2, 2);
    h.config(30, TEAM, 3, 3);

    let replay = test_event(TEAM, "$pageview")
        .already_succeeded(&["a (10)"])
        .already_failed(&["b (20)"])
        .build();

    let event = h
        .pipeline()
        .run_process_event(replay)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.sandbox.calls_to("process_event"), ["c"]);
    assert::markers(&event, "$plugins_succeeded", &["a (10)", "c (30)"]);
    assert::markers(&event, "$plugins_failed", &["b (20)"]);
}

#[tokio::test]
async fn side_effects_run_concurrently_and_fail_independently() {
    let h = Harness::new();
    let barrier = Arc::new(Barrier::new(3));

    for (id, name, fails) in [(1, "x", false), (2, "y", true), (3, "z", false)] {
        let barrier = Arc::clone(&barrier);
        h.plugin(
            id,
            name,
            Script::new().on_event(move |_| {
                let barrier = Arc::clone(&barrier);
                async move {
                    // Every call must be in flight before any can finish.
                    barrier.wait().await;
                    if fails {
                        Err(raised("webhook rejected", false))
                    } else {
                        Ok(())
                    }
                }
            }),
        );
        h.config(id * 10, TEAM, id, i32::try_from(id).unwrap());
    }

    let event = pageview(TEAM, "https://example.com");
    let summary = tokio::time::timeout(Duration::from_secs(1), h.pipeline().run_on_event(&event))
        .await
        .expect("on_event calls ran sequentially")
        .unwrap();

    assert_eq!(summary.invoked, 3);
    assert_eq!(summary.succeeded.len(), 2);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].config_id, 20);

    let rows = h.app_metric_rows().await;
    let successes: u64 = rows.iter().map(|r| r.successes).sum();
    let failures: u64 = rows.iter().map(|r| r.failures).sum();
    assert_eq!(successes, 2);
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn transient_failure_retried_to_ceiling_reports_once() {
    let h = Harness::new();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    h.plugin(
        1,
        "flaky",
        Script::new().on_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(raised("503 from upstream", true)) }
        }),
    );
    h.config(10, TEAM, 1, 1);

    let summary = h
        .pipeline()
        .run_on_event(&pageview(TEAM, "https://example.com"))
        .await
        .unwrap();

    let ceiling = h.services.settings().retry_max_attempts;
    assert_eq!(attempts.load(Ordering::SeqCst), ceiling);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].attempts, ceiling);
    assert!(matches!(
        summary.failed[0].source,
        InvocationError::Raised { retriable: true, .. }
    ));

    assert_eq!(h.store.plugin_errors().len(), 1);
    assert_eq!(
        h.services
            .metrics()
            .count("plugin.on_event.ERROR", "flaky", TEAM),
        1
    );

    let rows = h.app_metric_rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].failures, 1);
    assert_eq!(rows[0].successes, 0);
    assert!(rows[0].error_details.is_some());
}

#[tokio::test]
async fn success_after_retry_is_counted_as_such() {
    let h = Harness::new();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    h.plugin(
        1,
        "eventually",
        Script::new().on_event(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(raised("busy", true))
                } else {
                    Ok(())
                }
            }
        }),
    );
    h.config(10, TEAM, 1, 1);

    let summary = h
        .pipeline()
        .run_on_event(&pageview(TEAM, "https://example.com"))
        .await
        .unwrap();

    assert!(summary.failed.is_empty());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(h.store.plugin_errors().is_empty());

    let rows = h.app_metric_rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].successes, 1);
    assert_eq!(rows[0].successes_on_retry, 1);
}

#[tokio::test]
async fn non_retriable_side_effect_failure_is_not_retried() {
    let h = Harness::new();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    h.plugin(
        1,
        "strict",
        Script::new().on_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(raised("invalid payload", false)) }
        }),
    );
    h.config(10, TEAM, 1, 1);

    let summary = h
        .pipeline()
        .run_on_event(&pageview(TEAM, "https://example.com"))
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(summary.failed[0].attempts, 1);
}

#[tokio::test]
async fn store_outage_propagates_to_caller() {
    let h = Harness::new();
    h.plugin(1, "a", tag("a"));
    h.config(10, TEAM, 1, 1);
    h.store.set_unavailable(true);

    let err = h
        .pipeline()
        .run_process_event(pageview(TEAM, "https://example.com"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unavailable"));

    h.store.set_unavailable(false);
    assert!(
        h.pipeline()
            .run_process_event(pageview(TEAM, "https://example.com"))
            .await
            .unwrap()
            .is_some()
    );
}
