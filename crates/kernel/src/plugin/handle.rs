//! Live plugin handles and the sandbox contract they are built on.
//!
//! A [`Sandbox`] turns an [`ExtensionDefinition`] into a [`SandboxInstance`];
//! an [`ExtensionHandle`] wraps that instance with the typed entry points the
//! pipeline calls, routing every call through the shared [`WorkerPool`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ingestion_sdk::protocol::{
    self, JOB_PREFIX, ON_EVENT, PROCESS_EVENT, SCHEDULED_TASKS, SETUP_PLUGIN, TEARDOWN_PLUGIN,
};
use ingestion_sdk::types::{PluginEvent, PluginSetup};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::error::{InvocationError, PluginError};
use super::manifest::PluginManifest;
use crate::models::{ConfigId, DefinitionId, ExtensionDefinition};

/// How a task is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskType {
    /// On-demand, triggered by an external request.
    Job,
    /// Recurring (`runEveryMinute`, `runEveryHour`, `runEveryDay`).
    Schedule,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Job => "job",
            Self::Schedule => "schedule",
        })
    }
}

/// A named export of a sandbox instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub export: String,
}

impl EntryPoint {
    pub fn new(export: impl Into<String>) -> Self {
        Self {
            export: export.into(),
        }
    }
}

/// A task the plugin can run outside the event flow.
#[derive(Debug, Clone)]
pub struct PluginTask {
    pub name: String,
    pub task_type: TaskType,
    pub entry: EntryPoint,

    /// Runs are not reported as app metrics.
    pub ignore_for_app_metrics: bool,
}

/// Entry points present on a loaded plugin.
#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    pub setup: Option<EntryPoint>,
    pub teardown: Option<EntryPoint>,
    pub process_event: Option<EntryPoint>,
    pub on_event: Option<EntryPoint>,
    pub tasks: BTreeMap<(TaskType, String), PluginTask>,
}

impl MethodTable {
    /// Build the table from a module's export names.
    ///
    /// Jobs declared in the manifest must be exported.
    pub fn from_exports<'a>(
        plugin: &str,
        exports: impl IntoIterator<Item = &'a str>,
        manifest: Option<&PluginManifest>,
    ) -> Result<Self, PluginError> {
        let mut table = MethodTable::default();
        let ignored = |task: &str| manifest.is_some_and(|m| m.ignores_app_metrics(task));

        for export in exports {
            match export {
                SETUP_PLUGIN => table.setup = Some(EntryPoint::new(export)),
                TEARDOWN_PLUGIN => table.teardown = Some(EntryPoint::new(export)),
                PROCESS_EVENT => table.process_event = Some(EntryPoint::new(export)),
                ON_EVENT => table.on_event = Some(EntryPoint::new(export)),
                _ => {
                    let scheduled = SCHEDULED_TASKS
                        .iter()
                        .find(|(_, task_export)| *task_export == export)
                        .map(|(name, _)| *name);

                    if let Some(name) = scheduled {
                        table.insert_task(name, TaskType::Schedule, export, ignored(name));
                    } else {
                        match export.strip_prefix(JOB_PREFIX) {
                            Some(name) if !name.is_empty() => {
                                table.insert_task(name, TaskType::Job, export, ignored(name));
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        if let Some(manifest) = manifest {
            for job in manifest.job_names() {
                if table.task(job, TaskType::Job).is_none() {
                    return Err(PluginError::missing_export(plugin, job));
                }
            }
        }

        Ok(table)
    }

    fn insert_task(&mut self, name: &str, task_type: TaskType, export: &str, ignore: bool) {
        self.tasks.insert(
            (task_type, name.to_string()),
            PluginTask {
                name: name.to_string(),
                task_type,
                entry: EntryPoint::new(export),
                ignore_for_app_metrics: ignore,
            },
        );
    }

    /// Look up a task by name and type.
    pub fn task(&self, name: &str, task_type: TaskType) -> Option<&PluginTask> {
        self.tasks.get(&(task_type, name.to_string()))
    }

    /// Only `on_event` is implemented, so the transform stage defers it.
    pub fn is_side_effect_only(&self) -> bool {
        self.on_event.is_some() && self.process_event.is_none()
    }
}

/// A sandboxed plugin instance.
///
/// Implementations serialize calls into the underlying instance.
#[async_trait]
pub trait SandboxInstance: Send + Sync {
    fn methods(&self) -> &MethodTable;

    /// Call an entry point with optional JSON input.
    ///
    /// `Ok(None)` is an empty result, distinct from a raised error.
    async fn call(
        &self,
        entry: &EntryPoint,
        input: Option<String>,
    ) -> Result<Option<String>, InvocationError>;

    /// Release the instance. Later calls fail with `PoolClosed`.
    async fn dispose(&self);
}

/// Compiles and instantiates plugin definitions.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn instantiate(
        &self,
        definition: &ExtensionDefinition,
        manifest: Option<&PluginManifest>,
    ) -> Result<Arc<dyn SandboxInstance>, PluginError>;
}

/// Bounded pool gating every sandbox call, with a per-call deadline.
#[derive(Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl WorkerPool {
    pub fn new(concurrency: usize, timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `call` on a pool slot, aborting it once the deadline passes.
    pub async fn run<F, T>(&self, call: F) -> Result<T, InvocationError>
    where
        F: Future<Output = Result<T, InvocationError>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| InvocationError::PoolClosed)?;

        let mut task = tokio::spawn(async move {
            let _permit = permit;
            call.await
        });

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(InvocationError::Trapped(format!("plugin call panicked: {e}"))),
            Err(_) => {
                task.abort();
                Err(InvocationError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Refuse new calls; in-flight calls finish.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// Cache key for a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKey {
    /// Stateless definition shared by every team.
    Shared(DefinitionId),
    /// Per-config instance.
    Config(ConfigId),
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared(id) => write!(f, "definition:{id}"),
            Self::Config(id) => write!(f, "config:{id}"),
        }
    }
}

/// A live sandboxed plugin.
pub struct ExtensionHandle {
    key: HandleKey,
    definition: Arc<ExtensionDefinition>,
    manifest: Option<PluginManifest>,
    instance: Arc<dyn SandboxInstance>,
    pool: Arc<WorkerPool>,
}

impl fmt::Debug for ExtensionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionHandle")
            .field("key", &self.key)
            .field("plugin", &self.definition.name)
            .field("methods", self.instance.methods())
            .finish_non_exhaustive()
    }
}

impl ExtensionHandle {
    /// Instantiate `definition` and run its `setup_plugin`.
    ///
    /// Required config fields are checked against the manifest first and
    /// unset fields receive their declared defaults.
    pub async fn create(
        key: HandleKey,
        definition: Arc<ExtensionDefinition>,
        mut setup: PluginSetup,
        sandbox: &dyn Sandbox,
        pool: Arc<WorkerPool>,
    ) -> Result<Self, PluginError> {
        let plugin = definition.name.clone();

        let manifest = match definition.source.manifest.as_deref() {
            Some(raw) => Some(PluginManifest::parse_str(raw).map_err(|e| {
                PluginError::InvalidManifest {
                    plugin: plugin.clone(),
                    details: format!("{e:#}"),
                }
            })?),
            None => None,
        };

        if let Some(manifest) = &manifest {
            if let Some(field) = manifest.missing_required(&setup.config) {
                return Err(PluginError::MissingConfig {
                    plugin,
                    field: field.to_string(),
                });
            }
            manifest.apply_defaults(&mut setup.config);
        }

        let instance = sandbox.instantiate(&definition, manifest.as_ref()).await?;
        let handle = Self {
            key,
            definition,
            manifest,
            instance,
            pool,
        };

        if let Some(entry) = handle.methods().setup.clone() {
            let input = serde_json::to_string(&setup)
                .map_err(|e| PluginError::instantiation(&plugin, e))?;
            if let Err(source) = handle.call(&entry, Some(input)).await {
                handle.instance.dispose().await;
                return Err(PluginError::SetupFailed { plugin, source });
            }
        }

        debug!(plugin = %handle.definition.name, key = %handle.key, "plugin handle created");
        Ok(handle)
    }

    pub fn key(&self) -> HandleKey {
        self.key
    }

    pub fn definition(&self) -> &ExtensionDefinition {
        &self.definition
    }

    pub fn manifest(&self) -> Option<&PluginManifest> {
        self.manifest.as_ref()
    }

    pub fn methods(&self) -> &MethodTable {
        self.instance.methods()
    }

    /// Run `process_event`.
    ///
    /// `Ok(None)` means the plugin dropped the event. A returned event with
    /// a different `team_id` is corrected and reported as
    /// [`InvocationError::IllegalOperation`].
    pub async fn process_event(
        &self,
        event: &PluginEvent,
    ) -> Result<Option<PluginEvent>, InvocationError> {
        let entry = self
            .methods()
            .process_event
            .clone()
            .ok_or_else(|| missing(PROCESS_EVENT))?;

        let Some(output) = self.call(&entry, Some(encode(event)?)).await? else {
            return Ok(None);
        };

        let mut returned: PluginEvent = serde_json::from_str(&output)
            .map_err(|e| InvocationError::Malformed(format!("process_event reply: {e}")))?;

        if returned.team_id != event.team_id {
            returned.team_id = event.team_id;
            return Err(InvocationError::IllegalOperation {
                message: "Plugin tried to change event.team_id".to_string(),
                event: Box::new(returned),
            });
        }

        Ok(Some(returned))
    }

    /// Run `on_event`. The reply, if any, is ignored.
    pub async fn on_event(&self, event: &PluginEvent) -> Result<(), InvocationError> {
        let entry = self
            .methods()
            .on_event
            .clone()
            .ok_or_else(|| missing(ON_EVENT))?;

        self.call(&entry, Some(encode(event)?)).await?;
        Ok(())
    }

    /// Run a task with an optional JSON payload.
    pub async fn run_task(
        &self,
        task: &PluginTask,
        payload: Option<&Value>,
    ) -> Result<Option<Value>, InvocationError> {
        let input = payload.map(encode).transpose()?;
        match self.call(&task.entry, input).await? {
            Some(output) => serde_json::from_str(&output)
                .map(Some)
                .map_err(|e| InvocationError::Malformed(format!("{} reply: {e}", task.name))),
            None => Ok(None),
        }
    }

    async fn call(
        &self,
        entry: &EntryPoint,
        input: Option<String>,
    ) -> Result<Option<String>, InvocationError> {
        let instance = Arc::clone(&self.instance);
        let entry = entry.clone();
        self.pool
            .run(async move { instance.call(&entry, input).await })
            .await
    }

    /// Run `teardown_plugin` (best-effort) and release the instance.
    pub async fn dispose(&self) {
        if let Some(entry) = self.methods().teardown.clone() {
            if let Err(e) = self.call(&entry, None).await {
                warn!(
                    plugin = %self.definition.name,
                    key = %self.key,
                    error = %e,
                    "teardown_plugin failed"
                );
            }
        }
        self.instance.dispose().await;
        debug!(plugin = %self.definition.name, key = %self.key, "plugin handle disposed");
    }
}

fn missing(name: &str) -> InvocationError {
    InvocationError::MissingEntryPoint {
        name: name.to_string(),
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, InvocationError> {
    serde_json::to_string(value).map_err(|e| InvocationError::Malformed(format!("encode: {e}")))
}

/// Export name a scheduled task is looked up under.
pub fn schedule_export(task: &str) -> Option<&'static str> {
    SCHEDULED_TASKS
        .iter()
        .find(|(name, _)| *name == task)
        .map(|(_, export)| *export)
}

/// Export name for a task of the given type.
pub fn task_export(task: &str, task_type: TaskType) -> Option<String> {
    match task_type {
        TaskType::Schedule => schedule_export(task).map(str::to_string),
        TaskType::Job => Some(protocol::job_export(task)),
    }
}
