//! Inbound sides of a stage. Both feed text frames into one channel that the
//! stage pump drains in arrival order.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Dial an upstream stage's subscriber endpoint and follow it forever.
/// Returns only when the receiving side of `tx` is gone.
pub async fn follow_upstream(url: String, retry_delay: Duration, tx: mpsc::Sender<String>) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!("following upstream {}", url);
                let (_, mut stream) = ws.split();

                while let Some(msg) = stream.next().await {
                    match msg {
                        Ok(Message::Text(txt)) => {
                            if tx.send(txt.to_string()).await.is_err() {
                                return;
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!("upstream {} recv err: {}", url, e);
                            break;
                        }
                    }
                }
                warn!("upstream {} closed — reconnecting in {:?}", url, retry_delay);
            }
            Err(e) => {
                warn!("upstream {} connect failed: {} — retry in {:?}", url, e, retry_delay);
            }
        }

        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(retry_delay).await;
    }
}

/// Accept publisher connections from the previous stage.
pub async fn serve_ingest(listener: TcpListener, tx: mpsc::Sender<String>) -> Result<()> {
    let local = listener.local_addr().context("ingest listener addr")?;
    info!("ingest listening on ws://{}", local);

    loop {
        let (stream, peer) = listener.accept().await.context("ingest accept")?;
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_ingest(peer, stream, tx).await {
                debug!("ingest handler err {}: {}", peer, e);
            }
        });
    }
}

async fn handle_ingest(peer: SocketAddr, stream: TcpStream, tx: mpsc::Sender<String>) -> Result<()> {
    let ws = accept_async(stream).await.context("WS handshake failed")?;
    info!("publisher connected: {}", peer);

    let (mut sink, mut stream) = ws.split();
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("ingest recv err from {}: {}", peer, e);
                break;
            }
        };

        match msg {
            Message::Text(txt) => {
                if tx.send(txt.to_string()).await.is_err() {
                    break;
                }
            }
            Message::Ping(payload) => {
                let _ = sink.send(Message::Pong(payload)).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!("publisher disconnected: {}", peer);
    Ok(())
}
