//! Minimal read-only HTTP endpoint: GET /health, GET /state.
//!
//! One request per connection. The request line picks a [`Route`], the
//! stage's [`StatusReport`] turns it into a [`Reply`], and the reply is
//! written back with `Connection: close`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

const MAX_REQUEST: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Health,
    State,
    /// Known path, wrong method.
    WrongMethod,
    NotFound,
}

impl Route {
    /// Routes on the request line only; headers and body are ignored.
    pub fn from_request_line(line: &str) -> Self {
        let mut parts = line.split_whitespace();
        let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
            return Route::NotFound;
        };
        let path = target.split('?').next().unwrap_or(target);

        let route = match path {
            "/health" => Route::Health,
            "/state" => Route::State,
            _ => return Route::NotFound,
        };
        if method == "GET" { route } else { Route::WrongMethod }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status:       u16,
    pub content_type: &'static str,
    pub body:         String,
}

impl Reply {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self { status, content_type: "text/plain; charset=utf-8", body: body.into() }
    }

    pub fn json(value: &serde_json::Value) -> Self {
        Self {
            status: 200,
            content_type: "application/json; charset=utf-8",
            body: serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string()),
        }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            404 => "Not Found",
            405 => "Method Not Allowed",
            503 => "Service Unavailable",
            _ => "Internal Server Error",
        }
    }

    fn render(&self) -> String {
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            self.reason(),
            self.content_type,
            self.body.len(),
            self.body
        )
    }
}

/// What a stage exposes over HTTP. Only `state_json` is stage-specific;
/// `respond` maps every route and can be overridden to extend it.
#[async_trait]
pub trait StatusReport: Send + Sync {
    async fn state_json(&self) -> serde_json::Value;

    async fn respond(&self, route: Route) -> Reply {
        match route {
            Route::Health => Reply::text(200, "ok"),
            Route::State => Reply::json(&self.state_json().await),
            Route::WrongMethod => Reply::text(405, "method not allowed"),
            Route::NotFound => Reply::text(404, "not found"),
        }
    }
}

pub async fn serve_status(listener: TcpListener, report: Arc<dyn StatusReport>) -> Result<()> {
    let local: SocketAddr = listener.local_addr().context("http listener addr")?;
    info!("status http listening on http://{} (GET /health, /state)", local);

    loop {
        let (stream, peer) = listener.accept().await.context("http accept")?;
        let report = Arc::clone(&report);
        tokio::spawn(async move {
            if let Err(e) = answer(stream, report.as_ref()).await {
                debug!("http handler err {}: {}", peer, e);
            }
        });
    }
}

async fn answer(mut stream: TcpStream, report: &dyn StatusReport) -> Result<()> {
    let mut buf = vec![0u8; MAX_REQUEST];
    let n = stream.read(&mut buf).await.context("http read")?;
    if n == 0 {
        return Ok(());
    }

    let head = String::from_utf8_lossy(&buf[..n]);
    let route = Route::from_request_line(head.lines().next().unwrap_or_default());
    let reply = report.respond(route).await;

    stream.write_all(reply.render().as_bytes()).await.context("http write")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed;

    #[async_trait]
    impl StatusReport for Fixed {
        async fn state_json(&self) -> serde_json::Value {
            json!({ "stage": "test", "subscribers": 3 })
        }
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[test]
    fn request_line_routing() {
        assert_eq!(Route::from_request_line("GET /health HTTP/1.1"), Route::Health);
        assert_eq!(Route::from_request_line("GET /state?pretty=1 HTTP/1.1"), Route::State);
        assert_eq!(Route::from_request_line("POST /state HTTP/1.1"), Route::WrongMethod);
        assert_eq!(Route::from_request_line("GET /metrics HTTP/1.1"), Route::NotFound);
        assert_eq!(Route::from_request_line(""), Route::NotFound);
    }

    #[tokio::test]
    async fn serves_health_state_and_404() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_status(listener, Arc::new(Fixed)));

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200 OK"));
        assert!(health.ends_with("\r\n\r\nok"));

        let state = get(addr, "/state").await;
        let body = state.split("\r\n\r\n").nth(1).unwrap();
        let v: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(v["subscribers"], 3);

        assert!(get(addr, "/nope").await.starts_with("HTTP/1.1 404 Not Found"));
    }

    #[tokio::test]
    async fn overridden_respond_replaces_a_route() {
        struct Draining;

        #[async_trait]
        impl StatusReport for Draining {
            async fn state_json(&self) -> serde_json::Value {
                json!({})
            }

            async fn respond(&self, route: Route) -> Reply {
                match route {
                    Route::Health => Reply::text(503, "draining"),
                    other => Reply::text(404, format!("{other:?}")),
                }
            }
        }

        let reply = Draining.respond(Route::Health).await;
        assert_eq!(reply.status, 503);
        assert!(reply.render().starts_with("HTTP/1.1 503 Service Unavailable"));
    }
}
