//! Fan-out broadcaster: every connected subscriber gets every message.
//!
//! Each subscriber owns a bounded outbound queue drained by its own writer
//! task. `broadcast` only does `try_send` under the set lock, so a stalled
//! socket costs one full queue and then its membership; the others keep
//! receiving in the same call. Losing membership also closes the socket:
//! the handler waits on the subscriber's eviction channel, which fires as
//! soon as the entry leaves the set.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{Delivery, Publish};

pub const DEFAULT_QUEUE_DEPTH: usize = 256;

struct Subscriber {
    peer:   SocketAddr,
    tx:     mpsc::Sender<Message>,
    // dropped with the entry; the connection handler treats that as eviction
    _evict: oneshot::Sender<()>,
}

pub struct Broadcaster {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id:     AtomicU64,
    queue_depth: usize,
}

impl Broadcaster {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Adds a subscriber and hands back the receiving end of its queue.
    pub async fn register(&self, peer: SocketAddr) -> (u64, mpsc::Receiver<Message>) {
        let (id, rx, _) = self.join(peer).await;
        (id, rx)
    }

    /// Like `register`, plus a receiver that resolves once the subscriber
    /// is no longer in the set, whoever removed it.
    async fn join(&self, peer: SocketAddr) -> (u64, mpsc::Receiver<Message>, oneshot::Receiver<()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let (evict, evicted) = oneshot::channel();
        self.subscribers
            .lock()
            .await
            .insert(id, Subscriber { peer, tx, _evict: evict });
        (id, rx, evicted)
    }

    pub async fn remove(&self, id: u64) -> bool {
        self.subscribers.lock().await.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Queues `text` for every subscriber; returns how many accepted it.
    /// A full or closed queue removes that subscriber on the spot.
    pub async fn broadcast(&self, text: &str) -> usize {
        let msg = Message::Text(text.to_string().into());
        let mut subs = self.subscribers.lock().await;
        let mut delivered = 0usize;

        subs.retain(|id, sub| match sub.tx.try_send(msg.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("subscriber #{} {} too slow — dropping", id, sub.peer);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("subscriber #{} {} gone", id, sub.peer);
                false
            }
        });

        delivered
    }

    /// Accept loop for subscriber connections.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().context("subscriber listener addr")?;
        info!("subscribers listening on ws://{}", local);

        loop {
            let (stream, peer) = listener.accept().await.context("subscriber accept")?;
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.handle_subscriber(peer, stream).await {
                    debug!("subscriber handler err {}: {}", peer, e);
                }
            });
        }
    }

    async fn handle_subscriber(&self, peer: SocketAddr, stream: TcpStream) -> Result<()> {
        let ws = accept_async(stream).await.context("WS handshake failed")?;
        let (mut sink, mut stream) = ws.split();
        let (id, mut rx, mut evicted) = self.join(peer).await;
        info!("subscriber #{} connected: {}", id, peer);

        let mut writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    debug!("subscriber {} write err: {}", peer, e);
                    return;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        let liveness = async {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("subscriber {} recv err: {}", peer, e);
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = &mut writer => {}
            _ = liveness => {}
            _ = &mut evicted => debug!("subscriber #{} evicted, closing {}", id, peer),
        }

        // the socket closes once both halves are gone
        self.remove(id).await;
        writer.abort();
        drop(stream);
        info!("subscriber #{} disconnected: {}", id, peer);
        Ok(())
    }
}

#[async_trait]
impl Publish for Broadcaster {
    async fn publish(&self, text: String) -> Delivery {
        if self.broadcast(&text).await > 0 {
            Delivery::Sent
        } else {
            Delivery::Dropped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn text(msg: Message) -> String {
        match msg {
            Message::Text(t) => t.to_string(),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn failing_subscriber_is_pruned_others_still_receive() {
        let b = Broadcaster::new(8);
        let (_, mut rx1) = b.register(peer(1)).await;
        let (_, rx2) = b.register(peer(2)).await;
        let (_, mut rx3) = b.register(peer(3)).await;
        drop(rx2);

        assert_eq!(b.broadcast("{\"matchId\":1}").await, 2);
        assert_eq!(b.len().await, 2);
        assert_eq!(text(rx1.recv().await.unwrap()), "{\"matchId\":1}");
        assert_eq!(text(rx3.recv().await.unwrap()), "{\"matchId\":1}");
    }

    #[tokio::test]
    async fn full_queue_counts_as_write_failure() {
        let b = Broadcaster::new(1);
        let (_, _stalled) = b.register(peer(1)).await;
        let (_, mut live) = b.register(peer(2)).await;

        assert_eq!(b.broadcast("a").await, 2);
        assert_eq!(text(live.recv().await.unwrap()), "a");

        // stalled never drained its single slot
        assert_eq!(b.broadcast("b").await, 1);
        assert_eq!(b.len().await, 1);
        assert_eq!(text(live.recv().await.unwrap()), "b");
    }

    #[tokio::test]
    async fn pruning_signals_eviction() {
        let b = Broadcaster::new(1);
        let (_, _stalled, mut evicted) = b.join(peer(1)).await;

        assert_eq!(b.broadcast("a").await, 1);
        assert_eq!(evicted.try_recv(), Err(oneshot::error::TryRecvError::Empty));

        assert_eq!(b.broadcast("b").await, 0);
        assert!(b.is_empty().await);
        assert_eq!(evicted.try_recv(), Err(oneshot::error::TryRecvError::Closed));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_dropped() {
        let b = Broadcaster::new(4);
        assert!(b.is_empty().await);
        assert_eq!(b.publish("x".to_string()).await, Delivery::Dropped);

        let (id, _rx) = b.register(peer(9)).await;
        assert_eq!(b.publish("x".to_string()).await, Delivery::Sent);
        assert!(b.remove(id).await);
        assert!(!b.remove(id).await);
    }
}
