use anyhow::{Context, Result};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://apilive.sansabet.com";

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub base_url:           String,
    pub poll_interval:      Duration,
    pub discovery_interval: Duration,
    /// Provider sport code ("F" = football).
    pub sport:              String,
    pub regulation_minutes: i64,
    pub request_timeout:    Duration,
    pub max_in_flight:      usize,
    /// Ask for cursor 0 on every detail fetch.
    pub full_snapshots:     bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            poll_interval: Duration::from_secs(5),
            discovery_interval: Duration::from_secs(5),
            sport: "F".to_string(),
            regulation_minutes: 90,
            request_timeout: Duration::from_secs(10),
            max_in_flight: 32,
            full_snapshots: false,
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    match env_opt(key) {
        Some(v) => {
            let secs: u64 = v.parse().with_context(|| format!("Invalid {key}"))?;
            Ok(Duration::from_secs(secs.max(1)))
        }
        None => Ok(default),
    }
}

impl PollerConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let regulation_minutes = match env_opt("POLL_REGULATION_MINUTES") {
            Some(v) => v.parse().context("Invalid POLL_REGULATION_MINUTES")?,
            None => d.regulation_minutes,
        };
        let max_in_flight: usize = match env_opt("POLL_MAX_IN_FLIGHT") {
            Some(v) => v.parse().context("Invalid POLL_MAX_IN_FLIGHT")?,
            None => d.max_in_flight,
        };
        let full_snapshots = match env_opt("POLL_FULL_SNAPSHOTS") {
            Some(v) => v.parse().context("Invalid POLL_FULL_SNAPSHOTS")?,
            None => d.full_snapshots,
        };

        Ok(Self {
            base_url: env_opt("PROVIDER_BASE_URL").unwrap_or(d.base_url),
            poll_interval: env_secs("POLL_INTERVAL_SECS", d.poll_interval)?,
            discovery_interval: env_secs("DISCOVERY_INTERVAL_SECS", d.discovery_interval)?,
            sport: env_opt("POLL_SPORT").unwrap_or(d.sport),
            regulation_minutes,
            request_timeout: env_secs("POLL_REQUEST_TIMEOUT_SECS", d.request_timeout)?,
            max_in_flight: max_in_flight.max(1),
            full_snapshots,
        })
    }
}
