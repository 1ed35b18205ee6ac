//! Reload signals over Redis pub/sub.
//!
//! Plugin administration publishes a JSON payload naming what changed; every
//! worker listening on the channel drops the matching cache entries and
//! disposes the affected handles.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use redis::AsyncCommands;
use redis::Client as RedisClient;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::models::{ConfigId, DefinitionId, TeamId};
use crate::services::PluginServices;

/// Default pub/sub channel.
pub const DEFAULT_RELOAD_CHANNEL: &str = "reload-plugins";

/// Delay before resubscribing after the connection drops.
const RECONNECT_DELAY_SECS: u64 = 1;

/// What a reload affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadSignal {
    /// A plugin definition changed: its source, flags or disabled state.
    Definition(DefinitionId),
    /// A team's set of plugin configs changed.
    Team(TeamId),
    /// One plugin config changed.
    Config(ConfigId),
    /// Drop everything.
    All,
}

/// Wire shape of a reload payload.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ReloadPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    definition_id: Option<DefinitionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    team_id: Option<TeamId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config_id: Option<ConfigId>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    all: bool,
}

impl ReloadSignal {
    /// Parse a pub/sub payload. Exactly one selector must be present.
    pub fn parse(payload: &str) -> Result<Self> {
        let raw: ReloadPayload =
            serde_json::from_str(payload).context("reload payload is not valid JSON")?;

        let selected = [
            raw.definition_id.map(Self::Definition),
            raw.team_id.map(Self::Team),
            raw.config_id.map(Self::Config),
            raw.all.then_some(Self::All),
        ];
        let mut selected = selected.into_iter().flatten();

        match (selected.next(), selected.next()) {
            (Some(signal), None) => Ok(signal),
            (None, _) => bail!("reload payload names nothing to reload"),
            (Some(_), Some(_)) => bail!("reload payload names more than one target"),
        }
    }

    /// Encode as a pub/sub payload.
    pub fn to_payload(&self) -> String {
        let mut raw = ReloadPayload::default();
        match *self {
            Self::Definition(id) => raw.definition_id = Some(id),
            Self::Team(id) => raw.team_id = Some(id),
            Self::Config(id) => raw.config_id = Some(id),
            Self::All => raw.all = true,
        }
        serde_json::to_string(&raw).unwrap_or_default()
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Definition(_) => "definition",
            Self::Team(_) => "team",
            Self::Config(_) => "config",
            Self::All => "all",
        }
    }
}

impl fmt::Display for ReloadSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Definition(id) => write!(f, "definition {id}"),
            Self::Team(id) => write!(f, "team {id}"),
            Self::Config(id) => write!(f, "config {id}"),
            Self::All => f.write_str("all plugins"),
        }
    }
}

/// Publish a reload signal. Returns the number of listeners reached.
pub async fn publish(redis: &RedisClient, channel: &str, signal: ReloadSignal) -> Result<usize> {
    let mut conn = redis
        .get_multiplexed_async_connection()
        .await
        .context("failed to connect to Redis")?;
    let receivers: usize = conn
        .publish(channel, signal.to_payload())
        .await
        .context("failed to publish reload signal")?;
    Ok(receivers)
}

/// Subscribes to the reload channel and applies signals to the services.
pub struct ReloadListener {
    redis: RedisClient,
    channel: String,
    services: PluginServices,
}

impl ReloadListener {
    pub fn new(redis: RedisClient, channel: impl Into<String>, services: PluginServices) -> Self {
        Self {
            redis,
            channel: channel.into(),
            services,
        }
    }

    /// Run until `stop_rx` flips to true, resubscribing if the connection
    /// drops.
    pub fn spawn(self, mut stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = self.listen() => match result {
                        Ok(()) => warn!(channel = %self.channel, "reload subscription ended"),
                        Err(e) => warn!(channel = %self.channel, error = %e, "reload listener failed"),
                    },
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            debug!("reload listener stopping");
                            break;
                        }
                        continue;
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn listen(&self) -> Result<()> {
        let mut pubsub = self
            .redis
            .get_async_pubsub()
            .await
            .context("failed to open Redis pub/sub connection")?;
        pubsub
            .subscribe(&self.channel)
            .await
            .with_context(|| format!("failed to subscribe to {}", self.channel))?;
        info!(channel = %self.channel, "listening for plugin reloads");

        let mut messages = std::pin::pin!(pubsub.on_message());
        while let Some(msg) = messages.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "unreadable reload payload");
                    continue;
                }
            };

            match ReloadSignal::parse(&payload) {
                Ok(signal) => self.services.apply_reload(signal).await,
                Err(e) => warn!(payload = %payload, error = %e, "ignoring malformed reload payload"),
            }
        }

        Ok(())
    }
}
