//! Extension definitions and tenant bindings.
//!
//! An [`ExtensionDefinition`] is the installable unit (one row in
//! `posthog_plugin` plus its source files). An [`ExtensionConfig`] binds a
//! definition to a team with its own config values and attachments. Once a
//! config has a live sandbox handle attached it becomes a [`LoadedExtension`].

use std::collections::BTreeMap;
use std::sync::Arc;

use ingestion_sdk::types::{Attachment, PluginSetup};
use serde_json::{Map, Value};

use crate::plugin::{ExtensionHandle, HandleKey};

/// Team (tenant) identifier.
pub type TeamId = i64;

/// Plugin config identifier.
pub type ConfigId = i64;

/// Plugin definition identifier.
pub type DefinitionId = i64;

/// Opaque source blobs consumed by the sandbox.
#[derive(Debug, Clone, Default)]
pub struct SourceArtifacts {
    /// Compiled WASM module (`plugin.wasm`).
    pub wasm: Vec<u8>,

    /// Raw `plugin.json` manifest, if the plugin ships one.
    pub manifest: Option<String>,
}

/// An installable plugin.
///
/// Immutable once loaded; a reload replaces it wholesale.
#[derive(Debug, Clone)]
pub struct ExtensionDefinition {
    pub id: DefinitionId,

    /// Display name, used in logs, metric tags and event markers.
    pub name: String,

    /// One sandbox instance may serve every team using this plugin.
    pub stateless: bool,

    /// Disabled plugins are never instantiated.
    pub disabled: bool,

    /// Last recorded plugin-level error, if any.
    pub error: Option<String>,

    pub source: SourceArtifacts,
}

impl ExtensionDefinition {
    /// Cache key for handles built from this definition.
    pub fn handle_key(&self, config_id: ConfigId) -> HandleKey {
        if self.stateless {
            HandleKey::Shared(self.id)
        } else {
            HandleKey::Config(config_id)
        }
    }
}

/// A team's binding to a plugin.
#[derive(Debug, Clone)]
pub struct ExtensionConfig {
    pub id: ConfigId,
    pub team_id: TeamId,
    pub definition_id: DefinitionId,

    /// Execution position; lower runs first.
    pub order: i32,

    pub enabled: bool,

    /// Arbitrary key/value configuration set by the team.
    pub config: Map<String, Value>,

    /// Uploaded files keyed by config field.
    pub attachments: BTreeMap<String, Attachment>,
}

impl ExtensionConfig {
    /// Input for the plugin's `setup_plugin` entry point.
    pub fn setup(&self) -> PluginSetup {
        PluginSetup {
            config: self.config.clone(),
            attachments: self.attachments.clone(),
        }
    }
}

/// A config with its sandbox handle attached.
#[derive(Debug, Clone)]
pub struct LoadedExtension {
    pub config: ExtensionConfig,
    pub handle: Arc<ExtensionHandle>,
}

impl LoadedExtension {
    /// Plugin display name.
    pub fn plugin_name(&self) -> &str {
        &self.handle.definition().name
    }

    /// Identifier recorded in event marker properties.
    ///
    /// Format: `"<plugin name> (<config id>)"`.
    pub fn identifier(&self) -> String {
        format!("{} ({})", self.plugin_name(), self.config.id)
    }
}
