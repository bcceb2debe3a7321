//! odds-parser: provider stage of the relay chain
//!
//! What it does:
//!   1. Every few seconds scans the provider's all-live-events feed and
//!      registers football matches currently in play
//!   2. Polls each tracked match's detail feed, normalizes the markets
//!      into one MatchOdds record and publishes it as JSON
//!   3. Forwards records to the next stage (PARSER_PUBLISH_URL) and, when
//!      PARSER_SUBSCRIBER_BIND is set, to local subscribers too
//!
//! Run:
//!   cargo run --bin odds-parser

use anyhow::{Context, Result};
use async_trait::async_trait;
use dotenv::dotenv;
use live_poller::{EventDiscoverer, MatchPoller, MatchRegistry, PollerConfig, SansabetClient};
use logger::EventLogger;
use relay::broadcaster::DEFAULT_QUEUE_DEPTH;
use relay::stage::HEARTBEAT_EVERY;
use relay::status::{serve_status, StatusReport};
use relay::{Broadcaster, Publish, Publisher, RelayStage};
use std::env;
use std::fs::File;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

struct ParserConfig {
    publish_url:     Option<String>,
    subscriber_bind: Option<SocketAddr>,
    http_bind:       Option<SocketAddr>,
    reconnect_delay: Duration,
    log_dir:         String,
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl ParserConfig {
    fn from_env() -> Result<Self> {
        // set-but-empty disables forwarding
        let publish_url = match env::var("PARSER_PUBLISH_URL") {
            Ok(v) if v.trim().is_empty() => None,
            Ok(v) => Some(v.trim().to_string()),
            Err(_) => Some("ws://127.0.0.1:7100".to_string()),
        };

        let subscriber_bind = env_opt("PARSER_SUBSCRIBER_BIND")
            .map(|v| v.parse().context("Invalid PARSER_SUBSCRIBER_BIND"))
            .transpose()?;
        let http_bind = env_opt("PARSER_HTTP_BIND")
            .map(|v| v.parse().context("Invalid PARSER_HTTP_BIND"))
            .transpose()?;
        let reconnect_secs: u64 = env_opt("RELAY_RECONNECT_SECS")
            .unwrap_or_else(|| "5".to_string())
            .parse()
            .context("Invalid RELAY_RECONNECT_SECS")?;

        Ok(Self {
            publish_url,
            subscriber_bind,
            http_bind,
            reconnect_delay: Duration::from_secs(reconnect_secs),
            log_dir: env_opt("LOG_DIR").unwrap_or_else(|| "logs".to_string()),
        })
    }
}

/// `/state` for the parser: stage counters plus what is being tracked.
struct ParserStatus {
    stage:    Arc<RelayStage>,
    registry: Arc<MatchRegistry>,
}

#[async_trait]
impl StatusReport for ParserStatus {
    async fn state_json(&self) -> serde_json::Value {
        let mut state = self.stage.state_json().await;
        let matches = self.registry.snapshot().await;
        if let Some(obj) = state.as_object_mut() {
            obj.insert("tracked".to_string(), matches.len().into());
            let head: Vec<_> = matches.into_iter().take(50).collect();
            obj.insert("matches".to_string(), serde_json::to_value(head).unwrap_or_default());
        }
        state
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let poll = PollerConfig::from_env()?;
    let cfg = ParserConfig::from_env()?;

    info!("=== odds-parser — live odds provider stage ===");
    info!("Provider: {} (sport={}, window 0<min<{})", poll.base_url, poll.sport, poll.regulation_minutes);
    info!("Logs: {}/", cfg.log_dir);

    // Single instance lock
    let lock_file_path = env::temp_dir().join("live_odds_parser.lock");
    let lock_file = match File::create(&lock_file_path) {
        Ok(f) => f,
        Err(e) => {
            warn!("Failed to create lock file at {:?}: {}", lock_file_path, e);
            return Ok(());
        }
    };

    let mut lock = fd_lock::RwLock::new(lock_file);
    let _write_guard = match lock.try_write() {
        Ok(guard) => {
            info!("Acquired single-instance lock.");
            guard
        }
        Err(_) => {
            warn!("Another instance of odds-parser is already running! Exiting.");
            return Ok(());
        }
    };

    let logger = Arc::new(EventLogger::new(&cfg.log_dir));
    let client = SansabetClient::new(&poll.base_url, poll.request_timeout)
        .context("failed to build provider client")?;
    let feed = Arc::new(client);
    let registry = Arc::new(MatchRegistry::new());

    // Outbound hop
    let forward = cfg.publish_url.as_ref().map(|url| {
        info!("Forwarding records to {}", url);
        Arc::new(Publisher::new(url.clone(), cfg.reconnect_delay))
    });
    if let Some(forward) = &forward {
        tokio::spawn(Arc::clone(forward).run());
    } else {
        warn!("PARSER_PUBLISH_URL empty — records are not forwarded");
    }

    // Optional local fan-out
    let subscribers = Arc::new(Broadcaster::new(DEFAULT_QUEUE_DEPTH));
    if let Some(bind) = cfg.subscriber_bind {
        let listener = TcpListener::bind(bind).await.context("subscriber bind failed")?;
        let subscribers = Arc::clone(&subscribers);
        tokio::spawn(async move {
            if let Err(e) = subscribers.serve(listener).await {
                warn!("subscriber listener stopped: {e}");
            }
        });
    }

    let stage = Arc::new(RelayStage::new("parser", subscribers, forward, false));
    tokio::spawn(Arc::clone(&stage).heartbeat_loop(Arc::clone(&logger), HEARTBEAT_EVERY));

    // Minimal HTTP read-only state endpoint
    if let Some(bind) = cfg.http_bind {
        let listener = TcpListener::bind(bind).await.context("http bind failed")?;
        let report = Arc::new(ParserStatus {
            stage: Arc::clone(&stage),
            registry: Arc::clone(&registry),
        });
        tokio::spawn(async move {
            if let Err(e) = serve_status(listener, report).await {
                warn!("http server stopped: {e}");
            }
        });
    }

    let discoverer = Arc::new(EventDiscoverer::new(
        Arc::clone(&registry),
        feed.clone(),
        poll.sport.clone(),
        poll.regulation_minutes,
    ));
    tokio::spawn(discoverer.run(poll.discovery_interval, Arc::clone(&logger)));

    let poller = Arc::new(MatchPoller::new(
        registry,
        feed,
        vec![stage as Arc<dyn Publish>],
        poll.max_in_flight,
        poll.full_snapshots,
    ));
    poller.run(poll.poll_interval, logger).await;

    Ok(())
}
