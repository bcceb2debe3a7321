//! Provider HTTP client.
//!
//! Both endpoints answer gzip-compressed JSON; reqwest inflates it.
//!   GET {base}/api/LiveOdds/GetAll?SLID={cursor}
//!   GET {base}/api/LiveOdds/GetByParIDs?SLID={cursor}&ParIDs={match_id}

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, ORIGIN, REFERER};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider answered HTTP {0}")]
    Status(u16),
    #[error("body is not JSON: {0}")]
    Body(#[from] serde_json::Error),
}

/// Read side of the live odds provider.
#[async_trait]
pub trait LiveFeed: Send + Sync {
    /// All live events changed since `cursor`.
    async fn fetch_all(&self, cursor: i64) -> Result<Value, FetchError>;

    /// Detail snapshot(s) for one match since `cursor` (0 = full).
    async fn fetch_match(&self, cursor: i64, match_id: i64) -> Result<Value, FetchError>;
}

pub struct SansabetClient {
    http:     reqwest::Client,
    base_url: String,
}

impl SansabetClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(ORIGIN, HeaderValue::from_static("https://sansabet.com"));
        headers.insert(REFERER, HeaderValue::from_static("https://sansabet.com/"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .gzip(true)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn all_events_url(&self, cursor: i64) -> String {
        format!("{}/api/LiveOdds/GetAll?SLID={}", self.base_url, cursor)
    }

    pub fn match_url(&self, cursor: i64, match_id: i64) -> String {
        format!("{}/api/LiveOdds/GetByParIDs?SLID={}&ParIDs={}", self.base_url, cursor, match_id)
    }

    async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = resp.bytes().await?;
        parse_body(&body)
    }
}

/// An empty body means "nothing for you", same as `[]`.
fn parse_body(body: &[u8]) -> Result<Value, FetchError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Array(Vec::new()));
    }
    Ok(serde_json::from_slice(body)?)
}

#[async_trait]
impl LiveFeed for SansabetClient {
    async fn fetch_all(&self, cursor: i64) -> Result<Value, FetchError> {
        self.get_json(&self.all_events_url(cursor)).await
    }

    async fn fetch_match(&self, cursor: i64, match_id: i64) -> Result<Value, FetchError> {
        self.get_json(&self.match_url(cursor, match_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_provider_urls() {
        let c = SansabetClient::new("https://apilive.sansabet.com/", Duration::from_secs(10)).unwrap();
        assert_eq!(c.all_events_url(0), "https://apilive.sansabet.com/api/LiveOdds/GetAll?SLID=0");
        assert_eq!(
            c.match_url(5120, 4045678),
            "https://apilive.sansabet.com/api/LiveOdds/GetByParIDs?SLID=5120&ParIDs=4045678"
        );
    }

    #[test]
    fn empty_body_is_empty_array() {
        assert_eq!(parse_body(b"").unwrap(), Value::Array(vec![]));
        assert_eq!(parse_body(b" \n").unwrap(), Value::Array(vec![]));
        assert!(matches!(parse_body(b"<html>"), Err(FetchError::Body(_))));
    }
}
