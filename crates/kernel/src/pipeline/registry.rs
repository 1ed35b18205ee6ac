//! Tenant extension registry - which plugins run for which team.
//!
//! The registry maps a team to the ordered list of its enabled plugin
//! configs, each with a live handle attached. Lists are ordered by `order`
//! (lower runs first). Concurrent lookups for the same team share one store
//! query; entries live until a reload signal invalidates them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use moka::future::Cache;
use tracing::{debug, warn};

use crate::error::PipelineResult;
use crate::metrics::Metrics;
use crate::models::{ConfigId, DefinitionId, ExtensionConfig, LoadedExtension, TeamId};
use crate::plugin::ExtensionHandleCache;
use crate::store::ConfigStore;

/// The loaded plugins of one team.
#[derive(Debug, Clone, Default)]
pub struct TeamExtensions {
    /// Enabled plugins in execution order.
    pub extensions: Vec<LoadedExtension>,

    /// Every definition the team's configs referenced, including skipped
    /// ones, so a definition reload finds the teams it affects.
    pub definition_ids: BTreeSet<DefinitionId>,
}

impl TeamExtensions {
    pub fn iter(&self) -> std::slice::Iter<'_, LoadedExtension> {
        self.extensions.iter()
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Whether any of the team's configs has this id.
    pub fn contains_config(&self, config_id: ConfigId) -> bool {
        self.extensions.iter().any(|e| e.config.id == config_id)
    }
}

/// Registry of loaded plugin configs per team.
pub struct TenantExtensionRegistry {
    configs: Arc<dyn ConfigStore>,
    handles: Arc<ExtensionHandleCache>,
    metrics: Arc<Metrics>,
    teams: Cache<TeamId, Arc<TeamExtensions>>,
    points: Cache<ConfigId, Option<LoadedExtension>>,

    /// Bumped by every invalidation. A load that started under an older
    /// generation is evicted once it lands.
    generation: AtomicU64,
}

impl TenantExtensionRegistry {
    /// Create a registry holding at most `team_capacity` teams.
    pub fn new(
        configs: Arc<dyn ConfigStore>,
        handles: Arc<ExtensionHandleCache>,
        metrics: Arc<Metrics>,
        team_capacity: u64,
    ) -> Self {
        Self {
            configs,
            handles,
            metrics,
            teams: Cache::builder().max_capacity(team_capacity).build(),
            points: Cache::builder().max_capacity(team_capacity.saturating_mul(8)).build(),
            generation: AtomicU64::new(0),
        }
    }

    /// Ordered, enabled plugins for `team_id`.
    ///
    /// A team with no plugins gets an empty list. Store and instantiation
    /// failures are returned and not cached. A list loaded while a reload
    /// came in is handed to its waiters but not kept.
    pub async fn get_active_configs(&self, team_id: TeamId) -> PipelineResult<Arc<TeamExtensions>> {
        let configs = Arc::clone(&self.configs);
        let handles = Arc::clone(&self.handles);
        let generation = self.generation();

        let entry = self
            .teams
            .entry(team_id)
            .or_try_insert_with(async move {
                let rows = configs.fetch_enabled_configs(team_id).await?;
                load_team(&handles, team_id, rows).await.map(Arc::new)
            })
            .await?;

        if entry.is_fresh() && self.generation() != generation {
            debug!(team_id, "team reloaded during load, not caching");
            self.teams.invalidate(&team_id).await;
        }

        self.metrics.record_cache("teams", !entry.is_fresh());
        Ok(entry.into_value())
    }

    /// A single enabled config by id, with its handle.
    ///
    /// `None` if the config is deleted or disabled, or its definition is.
    pub async fn get_config(&self, config_id: ConfigId) -> PipelineResult<Option<LoadedExtension>> {
        let configs = Arc::clone(&self.configs);
        let handles = Arc::clone(&self.handles);
        let generation = self.generation();

        let entry = self
            .points
            .entry(config_id)
            .or_try_insert_with(async move {
                let Some(config) = configs.fetch_config(config_id).await? else {
                    return Ok(None);
                };
                attach(&handles, config).await
            })
            .await?;

        if entry.is_fresh() && self.generation() != generation {
            debug!(config_id, "config reloaded during load, not caching");
            self.points.invalidate(&config_id).await;
        }

        self.metrics.record_cache("configs", !entry.is_fresh());
        Ok(entry.into_value())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// The cached list of a team, without loading it.
    pub async fn cached_team(&self, team_id: TeamId) -> Option<Arc<TeamExtensions>> {
        self.teams.get(&team_id).await
    }

    /// Drop the cached list of one team and its point lookups.
    ///
    /// Returns every config id that was cached for the team through either
    /// path, so their handles can be disposed.
    pub async fn invalidate_team(&self, team_id: TeamId) -> BTreeSet<ConfigId> {
        self.bump_generation();

        let mut dropped: BTreeSet<ConfigId> = self
            .teams
            .get(&team_id)
            .await
            .map(|team| team.iter().map(|e| e.config.id).collect())
            .unwrap_or_default();
        self.teams.invalidate(&team_id).await;

        let configs: Vec<ConfigId> = self
            .points
            .iter()
            .filter(|(_, loaded)| loaded.as_ref().is_some_and(|l| l.config.team_id == team_id))
            .map(|(id, _)| *id)
            .collect();
        for config_id in configs {
            self.points.invalidate(&config_id).await;
            dropped.insert(config_id);
        }
        dropped
    }

    /// Drop one config and the list of every team it belongs to.
    ///
    /// The config's current team is looked up in the store as well, so a
    /// config enabled since the list was cached is picked up. Returns the
    /// affected teams.
    pub async fn invalidate_config(&self, config_id: ConfigId) -> Vec<TeamId> {
        self.bump_generation();
        self.points.invalidate(&config_id).await;

        let mut teams: BTreeSet<TeamId> = self
            .teams
            .iter()
            .filter(|(_, team)| team.contains_config(config_id))
            .map(|(team_id, _)| *team_id)
            .collect();

        match self.configs.fetch_config(config_id).await {
            Ok(Some(config)) => {
                teams.insert(config.team_id);
            }
            Ok(None) => {}
            Err(e) => warn!(config_id, error = %e, "failed to resolve team of reloaded config"),
        }

        for team_id in &teams {
            self.teams.invalidate(team_id).await;
        }
        teams.into_iter().collect()
    }

    /// Drop every cached entry that uses `definition_id`.
    ///
    /// Config lookups that resolved to nothing are dropped too, since the
    /// definition may have been the reason.
    pub async fn invalidate_definition(&self, definition_id: DefinitionId) -> Vec<TeamId> {
        self.bump_generation();

        let configs: Vec<ConfigId> = self
            .points
            .iter()
            .filter(|(_, loaded)| {
                loaded
                    .as_ref()
                    .is_none_or(|l| l.config.definition_id == definition_id)
            })
            .map(|(id, _)| *id)
            .collect();
        for config_id in configs {
            self.points.invalidate(&config_id).await;
        }

        let teams: Vec<TeamId> = self
            .teams
            .iter()
            .filter(|(_, team)| team.definition_ids.contains(&definition_id))
            .map(|(team_id, _)| *team_id)
            .collect();
        for team_id in &teams {
            self.teams.invalidate(team_id).await;
        }
        teams
    }

    /// Drop everything.
    pub fn invalidate_all(&self) {
        self.bump_generation();
        self.teams.invalidate_all();
        self.points.invalidate_all();
    }
}

async fn load_team(
    handles: &ExtensionHandleCache,
    team_id: TeamId,
    mut rows: Vec<ExtensionConfig>,
) -> PipelineResult<TeamExtensions> {
    rows.retain(|c| c.enabled);
    rows.sort_by_key(|c| c.order);

    let mut team = TeamExtensions::default();
    for config in rows {
        team.definition_ids.insert(config.definition_id);
        if let Some(loaded) = attach(handles, config).await? {
            team.extensions.push(loaded);
        }
    }

    debug!(team_id, plugins = team.len(), "loaded team plugins");
    Ok(team)
}

/// Attach a handle, or skip the config if its definition is missing or
/// disabled.
async fn attach(
    handles: &ExtensionHandleCache,
    config: ExtensionConfig,
) -> PipelineResult<Option<LoadedExtension>> {
    match handles.get_or_create_handle(config.definition_id, &config).await {
        Ok(handle) => Ok(Some(LoadedExtension { config, handle })),
        Err(e) if e.is_skippable() => {
            warn!(
                team_id = config.team_id,
                config_id = config.id,
                definition_id = config.definition_id,
                error = %e,
                "skipping plugin config"
            );
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
