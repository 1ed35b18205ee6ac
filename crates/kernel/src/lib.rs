//! Ingestion Plugin Kernel Library
//!
//! Runs tenant-configured WASM plugins over analytics events: a registry of
//! each team's enabled plugins, a cache of sandboxed plugin handles, the
//! two-stage event pipeline and the retry and metrics wrapper around every
//! plugin call. The worker binary is `ingestion-plugins`.

pub mod config;
pub mod error;
pub mod host;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod plugin;
pub mod reload;
pub mod services;
pub mod store;

pub use error::{ExtensionError, PipelineError, PipelineResult};
pub use services::PluginServices;
