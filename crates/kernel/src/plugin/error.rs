//! Plugin system error types with clear, actionable messages.
//!
//! [`PluginError`] covers loading a plugin into a sandbox; every variant
//! carries the plugin name. [`InvocationError`] covers a single call into an
//! already loaded plugin.

use ingestion_sdk::types::PluginEvent;
use thiserror::Error;

/// Errors that can occur while materializing a plugin handle.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin.json manifest could not be parsed.
    #[error("plugin '{plugin}': failed to parse manifest: {details}")]
    InvalidManifest { plugin: String, details: String },

    /// Plugin's WASM source file is missing or empty.
    #[error(
        "plugin '{plugin}': no plugin.wasm source found. Build with: cargo build -p {plugin} --target wasm32-wasip1 --release"
    )]
    MissingWasm { plugin: String },

    /// WASM module failed to compile.
    #[error("plugin '{plugin}': WASM compilation failed: {details}")]
    CompilationFailed { plugin: String, details: String },

    /// Plugin declares a task in its manifest but doesn't export it.
    #[error(
        "plugin '{plugin}': declares '{task}' in manifest but doesn't export function '{export_name}'"
    )]
    MissingExport {
        plugin: String,
        task: String,
        export_name: String,
    },

    /// A config field marked required in the manifest has no value.
    #[error("plugin '{plugin}': required config field '{field}' is not set")]
    MissingConfig { plugin: String, field: String },

    /// `setup_plugin` raised or trapped.
    #[error("plugin '{plugin}': setup_plugin failed: {source}")]
    SetupFailed {
        plugin: String,
        #[source]
        source: InvocationError,
    },

    /// General instantiation failure.
    #[error("plugin '{plugin}': failed to instantiate: {details}")]
    InstantiationFailed { plugin: String, details: String },
}

impl PluginError {
    /// Create a missing WASM error.
    pub fn missing_wasm(plugin: impl Into<String>) -> Self {
        Self::MissingWasm {
            plugin: plugin.into(),
        }
    }

    /// Create a missing export error for a manifest-declared task.
    pub fn missing_export(plugin: impl Into<String>, task: impl Into<String>) -> Self {
        let task = task.into();
        let export_name = ingestion_sdk::protocol::job_export(&task);
        Self::MissingExport {
            plugin: plugin.into(),
            task,
            export_name,
        }
    }

    /// Create an instantiation failure from any displayable cause.
    pub fn instantiation(plugin: impl Into<String>, details: impl std::fmt::Display) -> Self {
        Self::InstantiationFailed {
            plugin: plugin.into(),
            details: format!("{details:#}"),
        }
    }
}

/// Failure of a single call into a loaded plugin.
#[derive(Debug, Clone, Error)]
pub enum InvocationError {
    /// The plugin returned an error reply.
    #[error("plugin raised: {message}")]
    Raised { message: String, retriable: bool },

    /// The plugin's reply could not be decoded.
    #[error("malformed plugin output: {0}")]
    Malformed(String),

    /// The call exceeded its deadline or fuel budget.
    #[error("plugin call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The call used up its per-call fuel budget.
    #[error("plugin ran out of fuel ({fuel} units)")]
    OutOfFuel { fuel: u64 },

    /// The WASM instance trapped.
    #[error("plugin trapped: {0}")]
    Trapped(String),

    /// The plugin changed something it must not, such as the event's team.
    ///
    /// `event` holds the corrected event so the pipeline can carry on.
    #[error("illegal operation: {message}")]
    IllegalOperation {
        message: String,
        event: Box<PluginEvent>,
    },

    /// The entry point is not exported by the plugin.
    #[error("plugin does not export '{name}'")]
    MissingEntryPoint { name: String },

    /// The handle was disposed or the worker pool shut down.
    #[error("plugin worker pool closed")]
    PoolClosed,
}

impl InvocationError {
    /// Short error kind for reports and metric aggregation.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Raised { .. } => "PluginError",
            Self::Malformed(_) => "MalformedOutput",
            Self::Timeout { .. } => "Timeout",
            Self::OutOfFuel { .. } => "OutOfFuel",
            Self::Trapped(_) => "Trap",
            Self::IllegalOperation { .. } => "IllegalOperation",
            Self::MissingEntryPoint { .. } => "MissingEntryPoint",
            Self::PoolClosed => "PoolClosed",
        }
    }

    /// Whether the default retry predicate should try again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Raised { retriable, .. } => *retriable,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}
