//! Ingestion plugin worker.
//!
//! Reads newline-delimited JSON events from stdin, runs each team's plugins
//! over them and writes the surviving events to stdout.

use std::sync::Arc;

use anyhow::{Context, Result};
use ingestion_kernel::config::Config;
use ingestion_kernel::plugin::WasmSandbox;
use ingestion_kernel::reload::ReloadListener;
use ingestion_kernel::store::PgPluginStore;
use ingestion_kernel::PluginServices;
use ingestion_sdk::types::PluginEvent;
use redis::Client as RedisClient;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    info!("Starting ingestion plugin worker");

    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        workers = config.pipeline.worker_concurrency,
        timeout_ms = config.pipeline.timeout.as_millis() as u64,
        "Configuration loaded"
    );

    let store = Arc::new(
        PgPluginStore::connect(&config.database_url, config.database_max_connections).await?,
    );
    if !store.check_health().await {
        warn!("PostgreSQL health check failed");
    }
    let redis = RedisClient::open(config.redis_url.as_str()).context("invalid REDIS_URL")?;

    let sandbox = Arc::new(
        WasmSandbox::new(config.pipeline.runtime_config())
            .context("failed to create WASM runtime")?,
    );
    let services = PluginServices::new(config.pipeline.clone(), store, sandbox);

    info!("Database and Redis connections established");

    let (stop_tx, stop_rx) = watch::channel(false);
    let flusher = services.spawn_app_metrics_flusher(stop_rx.clone());
    let listener =
        ReloadListener::new(redis, config.reload_channel.clone(), services.clone()).spawn(stop_rx);

    let result = process_stdin(&services).await;

    stop_tx.send(true).ok();
    if let Err(e) = flusher.await {
        warn!(error = %e, "app metrics flusher panicked");
    }
    if let Err(e) = listener.await {
        warn!(error = %e, "reload listener panicked");
    }
    services.shutdown().await;

    // Final counter snapshot in Prometheus text format; stdout carries events.
    eprint!("{}", services.metrics().encode());
    info!("Worker stopped");
    result
}

/// Run every stdin event through both pipeline stages until EOF.
async fn process_stdin(services: &PluginServices) -> Result<()> {
    let pipeline = services.pipeline();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut processed = 0u64;

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }

        let event: PluginEvent = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping malformed event");
                continue;
            }
        };
        let team_id = event.team_id;

        let Some(event) = pipeline
            .run_process_event(event)
            .await
            .with_context(|| format!("failed to load plugins for team {team_id}"))?
        else {
            continue;
        };

        match pipeline.run_on_event(&event).await {
            Ok(summary) => debug!(
                team_id,
                invoked = summary.invoked,
                failed = summary.failed.len(),
                "on_event stage finished"
            ),
            Err(e) => warn!(team_id, error = %e, "failed to load team plugins for on_event"),
        }

        let mut out = serde_json::to_vec(&event).context("failed to encode event")?;
        out.push(b'\n');
        stdout.write_all(&out).await.context("failed to write stdout")?;
        processed += 1;
    }

    stdout.flush().await.context("failed to flush stdout")?;
    info!(processed, "reached end of input");
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
