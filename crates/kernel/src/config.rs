//! Configuration loaded from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::pipeline::{Backoff, RetryPolicy, StagePolicies};
use crate::plugin::RuntimeConfig;
use crate::reload::DEFAULT_RELOAD_CHANNEL;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL.
    pub database_url: String,

    /// Maximum database connections in pool (default: 10).
    pub database_max_connections: u32,

    /// Redis connection URL.
    pub redis_url: String,

    /// Pub/sub channel carrying reload signals (default: reload-plugins).
    pub reload_channel: String,

    pub pipeline: PipelineSettings,
}

/// Tunables of the plugin pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Concurrent plugin calls across all handles (default: 8).
    pub worker_concurrency: usize,

    /// Wall-clock deadline per plugin call (default: 30s).
    pub timeout: Duration,

    /// WASM fuel per call (default: 1 billion).
    pub fuel_per_call: u64,

    /// Maximum 64KB memory pages per instance (default: 1024).
    pub max_memory_pages: u64,

    /// Attempts for `on_event` calls, including the first (default: 5).
    pub retry_max_attempts: u32,

    /// Delay before the first `on_event` retry (default: 5s).
    pub retry_base: Duration,

    /// Upper bound for any retry delay (default: 60s).
    pub retry_max: Duration,

    /// Teams held in the registry at once (default: 10000).
    pub team_cache_capacity: u64,

    /// How often queued app metrics are written (default: 20s).
    pub app_metrics_flush: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            worker_concurrency: 8,
            timeout: Duration::from_secs(30),
            fuel_per_call: 1_000_000_000,
            max_memory_pages: 1024,
            retry_max_attempts: 5,
            retry_base: Duration::from_secs(5),
            retry_max: Duration::from_secs(60),
            team_cache_capacity: 10_000,
            app_metrics_flush: Duration::from_secs(20),
        }
    }
}

impl PipelineSettings {
    /// Load settings from `PLUGIN_*`, `TEAM_CACHE_CAPACITY` and
    /// `APP_METRICS_FLUSH_MS`, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            worker_concurrency: parse_env("PLUGIN_WORKER_CONCURRENCY", defaults.worker_concurrency)?,
            timeout: millis_env("PLUGIN_TIMEOUT_MS", defaults.timeout)?,
            fuel_per_call: parse_env("PLUGIN_FUEL_PER_CALL", defaults.fuel_per_call)?,
            max_memory_pages: parse_env("PLUGIN_MAX_MEMORY_PAGES", defaults.max_memory_pages)?,
            retry_max_attempts: parse_env("PLUGIN_RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?,
            retry_base: millis_env("PLUGIN_RETRY_BASE_MS", defaults.retry_base)?,
            retry_max: millis_env("PLUGIN_RETRY_MAX_MS", defaults.retry_max)?,
            team_cache_capacity: parse_env("TEAM_CACHE_CAPACITY", defaults.team_cache_capacity)?,
            app_metrics_flush: millis_env("APP_METRICS_FLUSH_MS", defaults.app_metrics_flush)?,
        })
    }

    /// Sandbox limits for the WASM runtime.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            max_memory_pages: self.max_memory_pages,
            fuel_per_call: self.fuel_per_call,
            ..RuntimeConfig::default()
        }
    }

    /// Retry policies per stage. Only `on_event` is retried.
    pub fn stage_policies(&self) -> StagePolicies {
        StagePolicies {
            on_event: RetryPolicy::new(
                self.retry_max_attempts,
                Backoff::exponential(self.retry_base, self.retry_max),
            ),
            ..StagePolicies::default()
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL environment variable is required")?;

        let database_max_connections = parse_env("DATABASE_MAX_CONNECTIONS", 10)?;

        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let reload_channel =
            env::var("RELOAD_CHANNEL").unwrap_or_else(|_| DEFAULT_RELOAD_CHANNEL.to_string());

        Ok(Self {
            database_url,
            database_max_connections,
            redis_url,
            reload_channel,
            pipeline: PipelineSettings::from_env()?,
        })
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

fn millis_env(key: &str, default: Duration) -> Result<Duration> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_env(key, default_ms).map(Duration::from_millis)
}
