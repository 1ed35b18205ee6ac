//! Property filter plugin.
//!
//! Removes a configured list of properties from every event. Nested
//! properties are addressed with dots (`$set.email`), and `drop_ip` also
//! clears the event's IP address.

use std::cell::RefCell;

use ingestion_sdk::prelude::*;
use serde_json::{Map, Value};

#[derive(Debug, Default)]
struct Filter {
    paths: Vec<Vec<String>>,
    drop_ip: bool,
}

thread_local! {
    static FILTER: RefCell<Filter> = RefCell::new(Filter::default());
}

fn parse_paths(raw: &str) -> Vec<Vec<String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.split('.').map(str::to_string).collect())
        .collect()
}

fn remove_path(properties: &mut Map<String, Value>, path: &[String]) {
    match path {
        [] => {}
        [last] => {
            properties.remove(last);
        }
        [head, rest @ ..] => {
            if let Some(Value::Object(nested)) = properties.get_mut(head) {
                remove_path(nested, rest);
            }
        }
    }
}

#[plugin_entry]
pub fn setup_plugin(setup: PluginSetup) -> Result<(), PluginFailure> {
    let properties = setup
        .config_str("properties")
        .ok_or("config 'properties' must be a comma separated string")?;

    let filter = Filter {
        paths: parse_paths(properties),
        drop_ip: setup.config_str("drop_ip") == Some("true"),
    };
    log("debug", &format!("filtering {} properties", filter.paths.len()));
    FILTER.with(|f| *f.borrow_mut() = filter);
    Ok(())
}

#[plugin_entry]
pub fn process_event(mut event: PluginEvent) -> Option<PluginEvent> {
    FILTER.with(|f| {
        let filter = f.borrow();
        for path in &filter.paths {
            remove_path(&mut event.properties, path);
        }
        if filter.drop_ip {
            event.ip = None;
            event.properties.remove("$ip");
        }
    });
    Some(event)
}
