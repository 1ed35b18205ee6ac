//! Plugin data models.

pub mod extension;

pub use extension::{
    ConfigId, DefinitionId, ExtensionConfig, ExtensionDefinition, LoadedExtension,
    SourceArtifacts, TeamId,
};
