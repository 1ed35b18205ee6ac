//! Pipeline error types.

use std::sync::Arc;

use thiserror::Error;

use crate::metrics::MetricCategory;
use crate::models::{ConfigId, DefinitionId, TeamId};
use crate::plugin::{InvocationError, PluginError};

/// Errors surfaced to callers of the pipeline, registry and handle cache.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Config is disabled or deleted. Callers treat this as a skip.
    #[error("plugin config {0} not found")]
    ConfigNotFound(ConfigId),

    #[error("plugin definition {0} not found")]
    DefinitionNotFound(DefinitionId),

    #[error("plugin definition {0} is disabled")]
    DefinitionDisabled(DefinitionId),

    /// Handle creation failed. Never cached.
    #[error(transparent)]
    Instantiation(#[from] PluginError),

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    /// Configuration or source store unavailable.
    #[error("plugin store error: {0:#}")]
    Store(#[from] anyhow::Error),

    /// Error shared by every caller awaiting the same cache population.
    #[error(transparent)]
    Shared(#[from] Arc<PipelineError>),
}

impl PipelineError {
    /// Unwrap shared errors down to the originating variant.
    pub fn root(&self) -> &PipelineError {
        match self {
            Self::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Whether the error means the plugin should be skipped rather than failing
    /// the whole lookup.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self.root(),
            Self::ConfigNotFound(_) | Self::DefinitionNotFound(_) | Self::DefinitionDisabled(_)
        )
    }
}

/// An extension call that failed after exhausting its retry policy.
#[derive(Debug, Error)]
#[error(
    "plugin '{plugin}' (config {config_id}, team {team_id}) failed {category} after {attempts} attempt(s): {source}"
)]
pub struct ExtensionError {
    pub team_id: TeamId,
    pub config_id: ConfigId,
    pub plugin: String,
    pub category: MetricCategory,
    pub attempts: u32,
    #[source]
    pub source: InvocationError,
}

/// Result type alias using PipelineError.
pub type PipelineResult<T> = Result<T, PipelineError>;
