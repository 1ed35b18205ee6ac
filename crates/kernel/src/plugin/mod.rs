//! Plugin system.
//!
//! This module handles:
//! - Parsing plugin metadata from `plugin.json` manifests
//! - Compiling and instantiating WASM plugins
//! - The handle cache that shares instances between callers

mod cache;
mod error;
mod handle;
mod manifest;
mod runtime;

pub use cache::ExtensionHandleCache;
pub use error::{InvocationError, PluginError};
pub use handle::{
    EntryPoint, ExtensionHandle, HandleKey, MethodTable, PluginTask, Sandbox, SandboxInstance,
    TaskType, WorkerPool, schedule_export, task_export,
};
pub use manifest::{ConfigField, PluginManifest, TaskOptions};
pub use runtime::{PluginState, RuntimeConfig, WasmInstance, WasmSandbox};
