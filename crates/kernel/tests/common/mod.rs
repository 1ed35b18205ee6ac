#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Common test utilities for integration tests.
//!
//! Tests drive the REAL pipeline, registry, caches, reporter and in-memory
//! store. Only the sandbox is replaced: [`ScriptedSandbox`] answers entry
//! point calls with Rust closures registered per plugin name, and records
//! every call it receives.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use ingestion_kernel::PluginServices;
use ingestion_kernel::config::PipelineSettings;
use ingestion_kernel::models::{
    ConfigId, DefinitionId, ExtensionConfig, ExtensionDefinition, SourceArtifacts, TeamId,
};
use ingestion_kernel::pipeline::EventPipeline;
use ingestion_kernel::plugin::{
    EntryPoint, InvocationError, MethodTable, PluginError, PluginManifest, Sandbox,
    SandboxInstance,
};
use ingestion_kernel::store::MemoryPluginStore;
use ingestion_sdk::types::PluginEvent;

pub type Reply = Result<Option<String>, InvocationError>;
pub type BoxReply = Pin<Box<dyn Future<Output = Reply> + Send>>;
pub type Handler = Arc<dyn Fn(Option<String>) -> BoxReply + Send + Sync>;

/// Wrap an async closure as an export handler.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Reply> + Send + 'static,
{
    Arc::new(move |input| -> BoxReply { Box::pin(f(input)) })
}

/// Behaviour of one scripted plugin, keyed by export name.
#[derive(Clone)]
pub struct Script {
    exports: BTreeMap<String, Handler>,
    manifest: Option<String>,
}

impl Script {
    /// A plugin exporting only `setup_plugin`.
    pub fn new() -> Self {
        let mut exports = BTreeMap::new();
        exports.insert(
            "setup_plugin".to_string(),
            handler(|_| async { Ok(None) }),
        );
        Self {
            exports,
            manifest: None,
        }
    }

    /// Raw handler for an export.
    pub fn export(mut self, name: &str, handler: Handler) -> Self {
        self.exports.insert(name.to_string(), handler);
        self
    }

    /// `process_event` backed by a synchronous transform.
    pub fn process_event<F>(self, f: F) -> Self
    where
        F: Fn(PluginEvent) -> Result<Option<PluginEvent>, InvocationError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.export(
            "process_event",
            handler(move |input| {
                let f = Arc::clone(&f);
                async move {
                    f(decode_event(input))
                        .map(|reply| reply.map(|e| serde_json::to_string(&e).unwrap()))
                }
            }),
        )
    }

    /// `process_event` that returns the event unchanged.
    pub fn passthrough(self) -> Self {
        self.process_event(|event| Ok(Some(event)))
    }

    /// `on_event` backed by an async closure.
    pub fn on_event<F, Fut>(self, f: F) -> Self
    where
        F: Fn(PluginEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), InvocationError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.export(
            "on_event",
            handler(move |input| {
                let f = Arc::clone(&f);
                async move { f(decode_event(input)).await.map(|()| None) }
            }),
        )
    }

    /// `on_event` that always succeeds.
    pub fn on_event_ok(self) -> Self {
        self.on_event(|_| async { Ok(()) })
    }

    /// A task export replying with a fixed value.
    pub fn task(self, export: &str, reply: Option<Value>) -> Self {
        self.export(
            export,
            handler(move |_| {
                let reply = reply.clone();
                async move { Ok(reply.map(|v| v.to_string())) }
            }),
        )
    }

    pub fn with_manifest(mut self, manifest: Value) -> Self {
        self.manifest = Some(manifest.to_string());
        self
    }
}

fn decode_event(input: Option<String>) -> PluginEvent {
    serde_json::from_str(&input.expect("event input")).expect("event JSON")
}

/// A raised plugin error.
pub fn raised(message: &str, retriable: bool) -> InvocationError {
    InvocationError::Raised {
        message: message.to_string(),
        retriable,
    }
}

struct ScriptedInstance {
    plugin: String,
    methods: MethodTable,
    script: Script,
    calls: Arc<Mutex<Vec<String>>>,
    disposed: Arc<AtomicUsize>,
}

#[async_trait]
impl SandboxInstance for ScriptedInstance {
    fn methods(&self) -> &MethodTable {
        &self.methods
    }

    async fn call(&self, entry: &EntryPoint, input: Option<String>) -> Reply {
        self.calls
            .lock()
            .push(format!("{}:{}", self.plugin, entry.export));
        match self.script.exports.get(&entry.export) {
            Some(handler) => handler(input).await,
            None => Err(InvocationError::MissingEntryPoint {
                name: entry.export.clone(),
            }),
        }
    }

    async fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sandbox that instantiates [`Script`]s by plugin name.
#[derive(Default)]
pub struct ScriptedSandbox {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Arc<Mutex<Vec<String>>>,
    disposed: Arc<AtomicUsize>,
    instantiations: AtomicUsize,
    fail_next: AtomicUsize,
}

impl ScriptedSandbox {
    pub fn register(&self, plugin: &str, script: Script) {
        self.scripts.lock().insert(plugin.to_string(), script);
    }

    /// Calls received so far, as `"<plugin>:<export>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Calls to one export, in order, without setup/teardown noise.
    pub fn calls_to(&self, export: &str) -> Vec<String> {
        let suffix = format!(":{export}");
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_suffix(&suffix).map(str::to_string))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn instantiations(&self) -> usize {
        self.instantiations.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Make the next `n` instantiations fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn instantiate(
        &self,
        definition: &ExtensionDefinition,
        manifest: Option<&PluginManifest>,
    ) -> Result<Arc<dyn SandboxInstance>, PluginError> {
        tokio::time::sleep(Duration::from_millis(5)).await;

        let pending_failures = self.fail_next.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_next.store(pending_failures - 1, Ordering::SeqCst);
            return Err(PluginError::instantiation(&definition.name, "scripted failure"));
        }

        let Some(script) = self.scripts.lock().get(&definition.name).cloned() else {
            return Err(PluginError::instantiation(&definition.name, "no script registered"));
        };
        let methods = MethodTable::from_exports(
            &definition.name,
            script.exports.keys().map(String::as_str),
            manifest,
        )?;

        self.instantiations.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedInstance {
            plugin: definition.name.clone(),
            methods,
            script,
            calls: Arc::clone(&self.calls),
            disposed: Arc::clone(&self.disposed),
        }))
    }
}

/// Settings with millisecond retries so retry tests stay fast.
pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        worker_concurrency: 16,
        timeout: Duration::from_secs(2),
        retry_base: Duration::from_millis(1),
        retry_max: Duration::from_millis(4),
        ..PipelineSettings::default()
    }
}

/// Real services over an in-memory store and a scripted sandbox.
pub struct Harness {
    pub store: Arc<MemoryPluginStore>,
    pub sandbox: Arc<ScriptedSandbox>,
    pub services: PluginServices,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(MemoryPluginStore::new(), fast_settings())
    }

    pub fn with_store(store: MemoryPluginStore, settings: PipelineSettings) -> Self {
        let store = Arc::new(store);
        let sandbox = Arc::new(ScriptedSandbox::default());
        let services = PluginServices::new(settings, Arc::clone(&store), sandbox.clone());
        Self {
            store,
            sandbox,
            services,
        }
    }

    pub fn pipeline(&self) -> &EventPipeline {
        self.services.pipeline()
    }

    /// Register a plugin definition named `name` with its script.
    pub fn plugin(&self, id: DefinitionId, name: &str, script: Script) {
        self.definition(id, name, script, false);
    }

    /// Register a stateless plugin definition.
    pub fn stateless_plugin(&self, id: DefinitionId, name: &str, script: Script) {
        self.definition(id, name, script, true);
    }

    fn definition(&self, id: DefinitionId, name: &str, script: Script, stateless: bool) {
        let manifest = script.manifest.clone();
        self.sandbox.register(name, script);
        self.store.insert_definition(ExtensionDefinition {
            id,
            name: name.to_string(),
            stateless,
            disabled: false,
            error: None,
            source: SourceArtifacts {
                wasm: vec![0, 97, 115, 109],
                manifest,
            },
        });
    }

    /// Bind a plugin to a team.
    pub fn config(&self, id: ConfigId, team_id: TeamId, definition_id: DefinitionId, order: i32) {
        self.config_with(id, team_id, definition_id, order, Map::new());
    }

    pub fn config_with(
        &self,
        id: ConfigId,
        team_id: TeamId,
        definition_id: DefinitionId,
        order: i32,
        config: Map<String, Value>,
    ) {
        self.store.insert_config(ExtensionConfig {
            id,
            team_id,
            definition_id,
            order,
            enabled: true,
            config,
            attachments: BTreeMap::new(),
        });
    }

    /// Flush queued app metrics into the store and return every row so far.
    pub async fn app_metric_rows(&self) -> Vec<ingestion_kernel::metrics::AppMetricRow> {
        self.services.flush_app_metrics().await.unwrap();
        self.store.app_metric_rows()
    }
}
