//! One hop of the relay chain.
//!
//! Every inbound text, in arrival order: counted, broadcast to subscribers,
//! then published to the forward hop. In snapshot mode the text only replaces
//! the latest snapshot and a ticker re-broadcasts it on a fixed cadence.

use anyhow::{Context, Result};
use async_trait::async_trait;
use logger::{now_iso, EventLogger, RelayHeartbeatEvent};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::broadcaster::{Broadcaster, DEFAULT_QUEUE_DEPTH};
use crate::publisher::Publisher;
use crate::status::StatusReport;
use crate::{Delivery, Publish};

pub const HEARTBEAT_EVERY: Duration = Duration::from_secs(10);

// ====================================================================
// Configuration
// ====================================================================

#[derive(Debug, Clone)]
pub struct StageConfig {
    pub name:            String,
    pub subscriber_bind: SocketAddr,
    pub ingest_bind:     Option<SocketAddr>,
    pub sources:         Vec<String>,
    pub forward_url:     Option<String>,
    pub reconnect_delay: Duration,
    /// `Some` switches the stage to snapshot mode.
    pub rebroadcast:     Option<Duration>,
    pub queue_depth:     usize,
    pub http_bind:       Option<SocketAddr>,
    pub log_dir:         String,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl StageConfig {
    pub fn from_env() -> Result<Self> {
        let name = env_opt("RELAY_STAGE").unwrap_or_else(|| "relay".to_string());

        let subscriber_bind = env_opt("RELAY_SUBSCRIBER_BIND")
            .unwrap_or_else(|| "0.0.0.0:7300".to_string())
            .parse()
            .context("Invalid RELAY_SUBSCRIBER_BIND")?;

        let ingest_bind = env_opt("RELAY_INGEST_BIND")
            .map(|v| v.parse().context("Invalid RELAY_INGEST_BIND"))
            .transpose()?;

        let sources = env_opt("RELAY_SOURCES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let reconnect_secs: u64 = env_opt("RELAY_RECONNECT_SECS")
            .unwrap_or_else(|| "5".to_string())
            .parse()
            .context("Invalid RELAY_RECONNECT_SECS")?;

        let rebroadcast = env_opt("RELAY_REBROADCAST_SECS")
            .map(|v| v.parse::<u64>().context("Invalid RELAY_REBROADCAST_SECS"))
            .transpose()?
            .map(|secs| Duration::from_secs(secs.max(1)));

        let queue_depth = env_opt("RELAY_SUBSCRIBER_QUEUE")
            .map(|v| v.parse::<usize>().context("Invalid RELAY_SUBSCRIBER_QUEUE"))
            .transpose()?
            .unwrap_or(DEFAULT_QUEUE_DEPTH);

        let http_bind = env_opt("RELAY_HTTP_BIND")
            .map(|v| v.parse().context("Invalid RELAY_HTTP_BIND"))
            .transpose()?;

        Ok(Self {
            name,
            subscriber_bind,
            ingest_bind,
            sources,
            forward_url: env_opt("RELAY_FORWARD_URL"),
            reconnect_delay: Duration::from_secs(reconnect_secs),
            rebroadcast,
            queue_depth,
            http_bind,
            log_dir: env_opt("LOG_DIR").unwrap_or_else(|| "logs".to_string()),
        })
    }
}

// ====================================================================
// Stage
// ====================================================================

#[derive(Debug, Default)]
pub struct StageStats {
    pub inbound: AtomicU64,
    /// Subscriber deliveries (one message to three subscribers counts three).
    pub relayed: AtomicU64,
    /// Messages the forward hop did not take.
    pub dropped: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
struct StageState {
    ts:          String,
    stage:       String,
    subscribers: usize,
    inbound:     u64,
    relayed:     u64,
    dropped:     u64,
    forward:     Option<String>,
    forward_url: Option<String>,
    snapshot:    bool,
}

pub struct RelayStage {
    name:        String,
    subscribers: Arc<Broadcaster>,
    forward:     Option<Arc<Publisher>>,
    latest:      Option<RwLock<Option<String>>>,
    stats:       StageStats,
}

impl RelayStage {
    pub fn new(
        name: impl Into<String>,
        subscribers: Arc<Broadcaster>,
        forward: Option<Arc<Publisher>>,
        snapshot_mode: bool,
    ) -> Self {
        Self {
            name: name.into(),
            subscribers,
            forward,
            latest: snapshot_mode.then(|| RwLock::new(None)),
            stats: StageStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &StageStats {
        &self.stats
    }

    pub fn subscribers(&self) -> &Arc<Broadcaster> {
        &self.subscribers
    }

    pub async fn latest_snapshot(&self) -> Option<String> {
        match &self.latest {
            Some(latest) => latest.read().await.clone(),
            None => None,
        }
    }

    pub async fn handle_inbound(&self, text: String) -> Delivery {
        self.stats.inbound.fetch_add(1, Ordering::Relaxed);

        if let Some(latest) = &self.latest {
            *latest.write().await = Some(text);
            return Delivery::Sent;
        }

        let delivered = self.subscribers.broadcast(&text).await;
        self.stats.relayed.fetch_add(delivered as u64, Ordering::Relaxed);

        let forwarded = match &self.forward {
            Some(forward) => {
                let d = forward.publish(text).await;
                if d == Delivery::Dropped {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
                d
            }
            None => Delivery::Dropped,
        };

        if delivered > 0 || forwarded == Delivery::Sent {
            Delivery::Sent
        } else {
            Delivery::Dropped
        }
    }

    /// Drains the stage inbox until every sender is gone.
    pub async fn pump(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        while let Some(text) = rx.recv().await {
            self.handle_inbound(text).await;
        }
        info!("[{}] inbox closed", self.name);
    }

    /// Snapshot-mode ticker. No-op on a streaming stage.
    pub async fn rebroadcast_loop(self: Arc<Self>, every: Duration) {
        if self.latest.is_none() {
            return;
        }
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Some(text) = self.latest_snapshot().await {
                let delivered = self.subscribers.broadcast(&text).await;
                self.stats.relayed.fetch_add(delivered as u64, Ordering::Relaxed);
                debug!("[{}] snapshot re-broadcast to {}", self.name, delivered);
            }
        }
    }

    pub async fn heartbeat_loop(self: Arc<Self>, logger: Arc<EventLogger>, every: Duration) {
        loop {
            tokio::time::sleep(every).await;

            let subscribers = self.subscribers.len().await;
            let hb = RelayHeartbeatEvent {
                ts: now_iso(),
                event: "RELAY_HEARTBEAT",
                stage: self.name.clone(),
                subscribers,
                inbound: self.stats.inbound.load(Ordering::Relaxed),
                relayed: self.stats.relayed.load(Ordering::Relaxed),
                dropped: self.stats.dropped.load(Ordering::Relaxed),
                forward: self.forward.as_ref().map(|f| f.state().to_string()),
            };
            let _ = logger.log(&hb);

            info!(
                "HB [{}]: subs={}, in={}, relayed={}, dropped={}, forward={}",
                hb.stage,
                hb.subscribers,
                hb.inbound,
                hb.relayed,
                hb.dropped,
                hb.forward.as_deref().unwrap_or("-"),
            );
        }
    }
}

#[async_trait]
impl Publish for RelayStage {
    async fn publish(&self, text: String) -> Delivery {
        self.handle_inbound(text).await
    }
}

#[async_trait]
impl StatusReport for RelayStage {
    async fn state_json(&self) -> serde_json::Value {
        let state = StageState {
            ts: now_iso(),
            stage: self.name.clone(),
            subscribers: self.subscribers.len().await,
            inbound: self.stats.inbound.load(Ordering::Relaxed),
            relayed: self.stats.relayed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            forward: self.forward.as_ref().map(|f| f.state().to_string()),
            forward_url: self.forward.as_ref().map(|f| f.url().to_string()),
            snapshot: self.latest.is_some(),
        };
        serde_json::to_value(state).unwrap_or_default()
    }
}
