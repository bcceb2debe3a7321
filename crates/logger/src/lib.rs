//! Live odds relay: audit logger
//! JSONL event stream, one file per UTC day

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

pub struct EventLogger {
    log_dir: PathBuf,
}

impl EventLogger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        let dir = log_dir.into();
        fs::create_dir_all(&dir).ok();
        Self { log_dir: dir }
    }

    pub fn log<T: Serialize>(&self, event: &T) -> Result<()> {
        let date  = Utc::now().format("%Y-%m-%d").to_string();
        let path  = self.log_dir.join(format!("{date}.jsonl"));
        let line  = serde_json::to_string(event)?;
        let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }

    pub fn log_dir(&self) -> &std::path::Path {
        &self.log_dir
    }
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

// ── Event types ───────────────────────────────────────────────────────────────

#[derive(Serialize, Debug)]
pub struct DiscoveryEvent {
    pub ts:            String,
    pub event:         &'static str,   // "DISCOVERY"
    pub cursor_before: i64,
    pub cursor_after:  i64,
    pub events_seen:   usize,
    pub qualifying:    usize,
    pub registered:    usize,
    pub tracked:       usize,
}

#[derive(Serialize, Debug)]
pub struct PollCycleEvent {
    pub ts:            String,
    pub event:         &'static str,   // "POLL_CYCLE"
    pub matches:       usize,
    pub published:     usize,
    pub incomplete:    usize,
    pub empty:         usize,
    pub malformed:     usize,
    pub fetch_failed:  usize,
    pub stale:         usize,          // older than the registry's refreshKey, not published
    pub task_failed:   usize,
    pub elapsed_ms:    u64,
}

#[derive(Serialize, Debug)]
pub struct RelayHeartbeatEvent {
    pub ts:            String,
    pub event:         &'static str,   // "RELAY_HEARTBEAT"
    pub stage:         String,
    pub subscribers:   usize,
    pub inbound:       u64,
    pub relayed:       u64,
    pub dropped:       u64,
    pub forward:       Option<String>, // forward connection state, None on terminal stages
}
