//! Outbound publisher: one persistent connection to the next hop.
//!
//! Disconnected → Connecting → Connected → (send/recv failure) → Disconnected,
//! retried after a fixed delay forever. Nothing is queued while the link is
//! down; `publish` just reports `Delivery::Dropped`.

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::{Delivery, Publish};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting   => "connecting",
            ConnectionState::Connected    => "connected",
        };
        f.write_str(s)
    }
}

struct Connection {
    sink:   WsSink,
    /// Wakes the read loop when a publish hits a dead socket.
    broken: Arc<Notify>,
}

pub struct Publisher {
    url:         String,
    retry_delay: Duration,
    state:       watch::Sender<ConnectionState>,
    conn:        Mutex<Option<Connection>>,
}

impl Publisher {
    pub fn new(url: impl Into<String>, retry_delay: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url: url.into(),
            retry_delay,
            state,
            conn: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connection loop. Runs for the lifetime of the process.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.state.send_replace(ConnectionState::Connecting);

            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    let (sink, mut stream) = ws.split();
                    let broken = Arc::new(Notify::new());
                    *self.conn.lock().await = Some(Connection { sink, broken: Arc::clone(&broken) });
                    self.state.send_replace(ConnectionState::Connected);
                    info!("publisher connected to {}", self.url);

                    // Inbound frames carry no data for us; read only to notice closure.
                    loop {
                        tokio::select! {
                            _ = broken.notified() => break,
                            msg = stream.next() => match msg {
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Err(e)) => {
                                    debug!("publisher recv err from {}: {}", self.url, e);
                                    break;
                                }
                                Some(Ok(_)) => {}
                            },
                        }
                    }

                    self.conn.lock().await.take();
                    self.state.send_replace(ConnectionState::Disconnected);
                    warn!("publisher lost {} — reconnecting in {:?}", self.url, self.retry_delay);
                }
                Err(e) => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    warn!("publisher connect to {} failed: {} — retry in {:?}", self.url, e, self.retry_delay);
                }
            }

            tokio::time::sleep(self.retry_delay).await;
        }
    }
}

#[async_trait]
impl Publish for Publisher {
    async fn publish(&self, text: String) -> Delivery {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Delivery::Dropped;
        };

        match conn.sink.send(Message::Text(text.into())).await {
            Ok(()) => Delivery::Sent,
            Err(e) => {
                warn!("publish to {} failed: {}", self.url, e);
                if let Some(dead) = guard.take() {
                    dead.broken.notify_one();
                }
                Delivery::Dropped
            }
        }
    }
}
