//! Plugin handle cache.
//!
//! Materializes one [`ExtensionHandle`] per [`HandleKey`]: stateless
//! definitions share a single handle across every team, everything else gets
//! one per config. Concurrent requests for the same key share one creation;
//! failed creations are not cached.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use moka::future::Cache;
use tracing::{debug, info, warn};

use super::handle::{ExtensionHandle, HandleKey, Sandbox, WorkerPool};
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::Metrics;
use crate::models::{DefinitionId, ExtensionConfig, ExtensionDefinition};
use crate::store::SourceStore;

/// Attempts at building a handle when reloads keep landing mid-creation.
const CREATE_ATTEMPTS: usize = 3;

/// Cache of plugin definitions and their live handles.
pub struct ExtensionHandleCache {
    sources: Arc<dyn SourceStore>,
    sandbox: Arc<dyn Sandbox>,
    pool: Arc<WorkerPool>,
    metrics: Arc<Metrics>,
    definitions: Cache<DefinitionId, Arc<ExtensionDefinition>>,
    handles: Cache<HandleKey, Arc<ExtensionHandle>>,

    /// Bumped by every disposal, so loads that raced one can be dropped.
    generation: AtomicU64,
}

impl ExtensionHandleCache {
    pub fn new(
        sources: Arc<dyn SourceStore>,
        sandbox: Arc<dyn Sandbox>,
        pool: Arc<WorkerPool>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sources,
            sandbox,
            pool,
            metrics,
            definitions: Cache::builder().build(),
            handles: Cache::builder().build(),
            generation: AtomicU64::new(0),
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Load a definition, sharing concurrent loads of the same id.
    pub async fn get_definition(&self, id: DefinitionId) -> PipelineResult<Arc<ExtensionDefinition>> {
        let sources = Arc::clone(&self.sources);
        let generation = self.generation();

        let entry = self
            .definitions
            .entry(id)
            .or_try_insert_with(async move {
                let definition = sources
                    .fetch_definition(id)
                    .await?
                    .ok_or(PipelineError::DefinitionNotFound(id))?;
                Ok::<_, PipelineError>(Arc::new(definition))
            })
            .await?;

        if entry.is_fresh() && self.generation() != generation {
            debug!(definition_id = id, "definition reloaded during load, not caching");
            self.definitions.invalidate(&id).await;
        }

        self.metrics.record_cache("definitions", !entry.is_fresh());
        Ok(entry.into_value())
    }

    /// Return the handle for `config`, creating it on first use.
    ///
    /// Disabled definitions are refused. A creation failure is returned to
    /// every waiting caller and the next call tries again. A handle whose
    /// creation overlapped a disposal is torn down and built again.
    pub async fn get_or_create_handle(
        &self,
        definition_id: DefinitionId,
        config: &ExtensionConfig,
    ) -> PipelineResult<Arc<ExtensionHandle>> {
        let mut attempt = 1;
        loop {
            let generation = self.generation();
            let (handle, fresh) = self.load_handle(definition_id, config).await?;
            if !fresh || self.generation() == generation || attempt == CREATE_ATTEMPTS {
                self.metrics.record_cache("handles", !fresh);
                return Ok(handle);
            }

            let key = handle.key();
            if self
                .handles
                .get(&key)
                .await
                .is_some_and(|current| Arc::ptr_eq(&current, &handle))
            {
                self.handles.invalidate(&key).await;
            }
            debug!(key = %key, attempt, "plugin reloaded during handle creation, rebuilding");
            handle.dispose().await;
            self.metrics.handles_disposed.inc();
            attempt += 1;
        }
    }

    async fn load_handle(
        &self,
        definition_id: DefinitionId,
        config: &ExtensionConfig,
    ) -> PipelineResult<(Arc<ExtensionHandle>, bool)> {
        let definition = self.get_definition(definition_id).await?;
        if definition.disabled {
            return Err(PipelineError::DefinitionDisabled(definition_id));
        }

        let key = definition.handle_key(config.id);
        let setup = config.setup();
        let sandbox = Arc::clone(&self.sandbox);
        let pool = Arc::clone(&self.pool);
        let metrics = Arc::clone(&self.metrics);

        let entry = self
            .handles
            .entry(key)
            .or_try_insert_with(async move {
                let handle =
                    ExtensionHandle::create(key, definition, setup, sandbox.as_ref(), pool).await?;
                metrics.handles_created.inc();
                Ok::<_, PipelineError>(Arc::new(handle))
            })
            .await
            .inspect_err(|e| {
                warn!(
                    team_id = config.team_id,
                    config_id = config.id,
                    key = %key,
                    error = %e,
                    "failed to create plugin handle"
                );
            })?;

        let fresh = entry.is_fresh();
        Ok((entry.into_value(), fresh))
    }

    /// Cached handle for `key`, if any.
    pub async fn get(&self, key: HandleKey) -> Option<Arc<ExtensionHandle>> {
        self.handles.get(&key).await
    }

    /// Dispose and forget the handle for `key`.
    pub async fn dispose(&self, key: HandleKey) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let Some(handle) = self.handles.remove(&key).await else {
            return false;
        };
        handle.dispose().await;
        self.metrics.handles_disposed.inc();
        debug!(key = %key, "disposed plugin handle");
        true
    }

    /// Forget a definition and dispose every handle built from it.
    pub async fn dispose_definition(&self, id: DefinitionId) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.definitions.invalidate(&id).await;

        let keys: Vec<HandleKey> = self
            .handles
            .iter()
            .filter(|(_, handle)| handle.definition().id == id)
            .map(|(key, _)| *key)
            .collect();

        let mut disposed = 0;
        for key in keys {
            if self.dispose(key).await {
                disposed += 1;
            }
        }
        info!(definition_id = id, disposed, "reloaded plugin definition");
        disposed
    }

    /// Forget every definition and dispose every handle.
    pub async fn dispose_all(&self) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.definitions.invalidate_all();

        let keys: Vec<HandleKey> = self.handles.iter().map(|(key, _)| *key).collect();
        let mut disposed = 0;
        for key in keys {
            if self.dispose(key).await {
                disposed += 1;
            }
        }
        disposed
    }

    /// Every live handle.
    pub fn handles(&self) -> Vec<Arc<ExtensionHandle>> {
        self.handles.iter().map(|(_, handle)| handle).collect()
    }
}
