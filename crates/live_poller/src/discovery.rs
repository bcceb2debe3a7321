//! Event discovery from the all-live-events feed.
//!
//! Each event: { "H": { "SLID": 5120, "PID": 4045678, "S": "F" }, "P": { "T": { "M": "37" } } }
//! An event qualifies when its sport matches and 0 < minute < regulation.
//! The global cursor moves to the highest SLID seen, qualifying or not.

use logger::{now_iso, DiscoveryEvent, EventLogger};
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::{FetchError, LiveFeed};
use crate::registry::{Match, MatchRegistry};

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "H")]
    header: RawEventHeader,
    #[serde(rename = "P", default)]
    progress: Option<RawProgress>,
}

#[derive(Debug, Deserialize)]
struct RawEventHeader {
    #[serde(rename = "SLID")]
    cursor: Option<i64>,
    #[serde(rename = "PID")]
    match_id: Option<i64>,
    #[serde(rename = "S")]
    sport: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawProgress {
    #[serde(rename = "T", default)]
    clock: Option<RawClock>,
}

#[derive(Debug, Deserialize)]
struct RawClock {
    /// Elapsed minute; the provider sends it as a string.
    #[serde(rename = "M", default)]
    minute: Option<Value>,
}

impl RawEvent {
    fn minute(&self) -> Option<i64> {
        match self.progress.as_ref()?.clock.as_ref()?.minute.as_ref()? {
            Value::String(s) => s.trim().parse().ok(),
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }
}

/// Result of one pass over the feed, before touching the registry.
#[derive(Debug, Default, PartialEq)]
struct Scan {
    max_cursor: Option<i64>,
    seen:       usize,
    qualifying: Vec<i64>,
}

fn scan_events(payload: &Value, sport: &str, regulation_minutes: i64) -> Scan {
    let mut scan = Scan::default();
    let Some(events) = payload.as_array() else {
        warn!("all-events feed is not an array, ignoring");
        return scan;
    };

    for raw in events {
        scan.seen += 1;
        let event = match RawEvent::deserialize(raw) {
            Ok(e) => e,
            Err(e) => {
                debug!("skipping unreadable event: {}", e);
                continue;
            }
        };

        if let Some(cursor) = event.header.cursor {
            scan.max_cursor = Some(scan.max_cursor.map_or(cursor, |c| c.max(cursor)));
        }

        if event.header.sport.as_deref() != Some(sport) {
            continue;
        }
        let Some(match_id) = event.header.match_id else {
            continue;
        };
        match event.minute() {
            Some(minute) if minute > 0 && minute < regulation_minutes => scan.qualifying.push(match_id),
            _ => {}
        }
    }

    scan
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub cursor_before: i64,
    pub cursor_after:  i64,
    pub events_seen:   usize,
    pub qualifying:    usize,
    pub registered:    usize,
}

pub struct EventDiscoverer {
    registry:           Arc<MatchRegistry>,
    feed:               Arc<dyn LiveFeed>,
    sport:              String,
    regulation_minutes: i64,
    cursor:             AtomicI64,
}

impl EventDiscoverer {
    pub fn new(
        registry: Arc<MatchRegistry>,
        feed: Arc<dyn LiveFeed>,
        sport: impl Into<String>,
        regulation_minutes: i64,
    ) -> Self {
        Self {
            registry,
            feed,
            sport: sport.into(),
            regulation_minutes,
            cursor: AtomicI64::new(0),
        }
    }

    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::Relaxed)
    }

    pub async fn run_once(&self) -> Result<DiscoveryReport, FetchError> {
        let cursor_before = self.cursor();
        let payload = self.feed.fetch_all(cursor_before).await?;
        let scan = scan_events(&payload, &self.sport, self.regulation_minutes);

        if let Some(max) = scan.max_cursor {
            self.cursor.fetch_max(max, Ordering::Relaxed);
        }

        let mut registered = 0usize;
        for &match_id in &scan.qualifying {
            if self.registry.upsert_if_absent(Match::discovered(match_id)).await {
                info!("new live match {} registered", match_id);
                registered += 1;
            }
        }

        Ok(DiscoveryReport {
            cursor_before,
            cursor_after: self.cursor(),
            events_seen: scan.seen,
            qualifying: scan.qualifying.len(),
            registered,
        })
    }

    pub async fn run(self: Arc<Self>, interval: Duration, logger: Arc<EventLogger>) {
        info!(
            "discovery starting — every {:?}, sport={}, window 0<min<{}",
            interval, self.sport, self.regulation_minutes
        );

        loop {
            match self.run_once().await {
                Ok(report) => {
                    let tracked = self.registry.len().await;
                    let ev = DiscoveryEvent {
                        ts: now_iso(),
                        event: "DISCOVERY",
                        cursor_before: report.cursor_before,
                        cursor_after: report.cursor_after,
                        events_seen: report.events_seen,
                        qualifying: report.qualifying,
                        registered: report.registered,
                        tracked,
                    };
                    let _ = logger.log(&ev);
                    debug!(
                        "discovery: cursor {}→{}, seen={}, live={}, new={}, tracked={}",
                        report.cursor_before, report.cursor_after, report.events_seen,
                        report.qualifying, report.registered, tracked
                    );
                }
                Err(e) => warn!("discovery fetch failed: {}", e),
            }

            tokio::time::sleep(interval).await;
        }
    }
}
