//! relay-stage: one hop of the odds relay chain (aggregator, analyzer, frontend)
//!
//! Inbound:  RELAY_INGEST_BIND (previous stage publishes to us) and/or
//!           RELAY_SOURCES (we dial previous stages' subscriber endpoints)
//! Outbound: subscribers on RELAY_SUBSCRIBER_BIND, plus RELAY_FORWARD_URL
//!
//! Run:
//!   $env:RELAY_STAGE="aggregator"; $env:RELAY_INGEST_BIND="0.0.0.0:7100"; cargo run --bin relay-stage

use anyhow::{Context, Result};
use dotenv::dotenv;
use logger::EventLogger;
use relay::source::{follow_upstream, serve_ingest};
use relay::stage::HEARTBEAT_EVERY;
use relay::status::serve_status;
use relay::{Broadcaster, Publisher, RelayStage, StageConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const INBOX_DEPTH: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = StageConfig::from_env()?;
    info!("=== relay-stage [{}] ===", cfg.name);

    let logger = Arc::new(EventLogger::new(&cfg.log_dir));

    let subscribers = Arc::new(Broadcaster::new(cfg.queue_depth));
    let listener = TcpListener::bind(cfg.subscriber_bind)
        .await
        .context("subscriber bind failed")?;
    {
        let subscribers = Arc::clone(&subscribers);
        tokio::spawn(async move {
            if let Err(e) = subscribers.serve(listener).await {
                warn!("subscriber listener stopped: {e}");
            }
        });
    }

    let forward = cfg.forward_url.as_ref().map(|url| {
        info!("[{}] forwarding to {}", cfg.name, url);
        Arc::new(Publisher::new(url.clone(), cfg.reconnect_delay))
    });
    if let Some(forward) = &forward {
        tokio::spawn(Arc::clone(forward).run());
    }

    let stage = Arc::new(RelayStage::new(
        cfg.name.clone(),
        subscribers,
        forward,
        cfg.rebroadcast.is_some(),
    ));

    let (tx, rx) = mpsc::channel::<String>(INBOX_DEPTH);

    for url in &cfg.sources {
        tokio::spawn(follow_upstream(url.clone(), cfg.reconnect_delay, tx.clone()));
    }

    if let Some(bind) = cfg.ingest_bind {
        let listener = TcpListener::bind(bind).await.context("ingest bind failed")?;
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_ingest(listener, tx).await {
                warn!("ingest listener stopped: {e}");
            }
        });
    }

    if cfg.sources.is_empty() && cfg.ingest_bind.is_none() {
        warn!("[{}] no RELAY_SOURCES and no RELAY_INGEST_BIND — nothing will arrive", cfg.name);
    }

    if let Some(every) = cfg.rebroadcast {
        info!("[{}] snapshot mode: re-broadcast every {:?}", cfg.name, every);
        tokio::spawn(Arc::clone(&stage).rebroadcast_loop(every));
    }

    tokio::spawn(Arc::clone(&stage).heartbeat_loop(Arc::clone(&logger), HEARTBEAT_EVERY));

    // Minimal HTTP read-only state endpoint
    if let Some(bind) = cfg.http_bind {
        let listener = TcpListener::bind(bind).await.context("http bind failed")?;
        let report = Arc::clone(&stage);
        tokio::spawn(async move {
            if let Err(e) = serve_status(listener, report).await {
                warn!("http server stopped: {e}");
            }
        });
    }

    // Held so the inbox stays open with no configured inputs.
    let _inbox = tx;
    stage.pump(rx).await;

    Ok(())
}
