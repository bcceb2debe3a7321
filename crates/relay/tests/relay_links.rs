use futures_util::{SinkExt, Stream, StreamExt};
use relay::source::{follow_upstream, serve_ingest};
use relay::{Broadcaster, ConnectionState, Delivery, Publish, Publisher, RelayStage};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(5);

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn serve_subscribers(b: &Arc<Broadcaster>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(b).serve(listener));
    addr
}

async fn next_text<S>(ws: &mut S) -> String
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match timeout(WAIT, ws.next()).await.expect("no message in time") {
            Some(Ok(Message::Text(t))) => return t.to_string(),
            Some(Ok(_)) => continue,
            other => panic!("stream ended: {:?}", other),
        }
    }
}

#[tokio::test]
async fn publisher_drops_during_outage_and_delivers_after_reconnect() {
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let publisher = Arc::new(Publisher::new(format!("ws://{addr}"), Duration::from_millis(50)));
    let mut state = publisher.subscribe_state();
    tokio::spawn(Arc::clone(&publisher).run());

    for i in 0..3 {
        assert_eq!(publisher.publish(format!("during-{i}")).await, Delivery::Dropped);
        sleep(Duration::from_millis(60)).await;
    }

    let listener = TcpListener::bind(addr).await.unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        next_text(&mut ws).await
    });

    timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .expect("publisher never reconnected")
        .unwrap();

    assert_eq!(publisher.publish("after".to_string()).await, Delivery::Sent);

    // nothing from the outage is replayed ahead of it
    let first = timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(first, "after");
}

#[tokio::test]
async fn closed_subscriber_is_pruned_and_the_rest_keep_receiving() {
    let subs = Arc::new(Broadcaster::new(16));
    let addr = serve_subscribers(&subs).await;
    let url = format!("ws://{addr}");

    let (mut a, _) = connect_async(url.as_str()).await.unwrap();
    let (mut b, _) = connect_async(url.as_str()).await.unwrap();
    let (mut c, _) = connect_async(url.as_str()).await.unwrap();
    eventually("three subscribers", || {
        let subs = Arc::clone(&subs);
        async move { subs.len().await == 3 }
    })
    .await;

    b.send(Message::Close(None)).await.unwrap();
    eventually("pruned subscriber", || {
        let subs = Arc::clone(&subs);
        async move { subs.len().await == 2 }
    })
    .await;

    assert_eq!(subs.broadcast("{\"matchId\":42}").await, 2);
    assert_eq!(next_text(&mut a).await, "{\"matchId\":42}");
    assert_eq!(next_text(&mut c).await, "{\"matchId\":42}");
}

#[tokio::test]
async fn pruned_slow_subscriber_is_disconnected_without_draining_its_queue() {
    const DEPTH: usize = 4;
    const CHUNK: usize = 8 << 20;

    let subs = Arc::new(Broadcaster::new(DEPTH));
    let addr = serve_subscribers(&subs).await;
    let (mut stalled, _) = connect_async(format!("ws://{addr}").as_str()).await.unwrap();
    eventually("one subscriber", || {
        let subs = Arc::clone(&subs);
        async move { subs.len().await == 1 }
    })
    .await;

    // never read: the writer blocks on the socket, then the queue fills
    let big = "x".repeat(CHUNK);
    let mut rounds = 0;
    while !subs.is_empty().await {
        assert!(rounds < 64, "stalled subscriber was never pruned");
        subs.broadcast(&big).await;
        rounds += 1;
        sleep(Duration::from_millis(20)).await;
    }

    let mut received = 0usize;
    let drained = timeout(WAIT, async {
        while let Some(Ok(msg)) = stalled.next().await {
            received += msg.len();
        }
    })
    .await;

    assert!(drained.is_ok(), "pruned subscriber was left connected");
    assert!(
        received < DEPTH * CHUNK,
        "{received} bytes reached a subscriber after it was pruned"
    );
}

#[tokio::test]
async fn record_travels_through_two_chained_stages() {
    // downstream stage: ingest -> subscribers
    let down_subs = Arc::new(Broadcaster::new(16));
    let down_sub_addr = serve_subscribers(&down_subs).await;
    let downstream = Arc::new(RelayStage::new("aggregator", Arc::clone(&down_subs), None, false));

    let ingest = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ingest_addr = ingest.local_addr().unwrap();
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(serve_ingest(ingest, tx));
    tokio::spawn(Arc::clone(&downstream).pump(rx));

    // upstream stage: publishes forward into the downstream ingest
    let forward = Arc::new(Publisher::new(format!("ws://{ingest_addr}"), Duration::from_millis(50)));
    let mut forward_state = forward.subscribe_state();
    tokio::spawn(Arc::clone(&forward).run());
    let upstream = RelayStage::new("parser", Arc::new(Broadcaster::new(16)), Some(forward), false);

    let (mut display, _) = connect_async(format!("ws://{down_sub_addr}").as_str()).await.unwrap();
    eventually("display subscriber", || {
        let subs = Arc::clone(&down_subs);
        async move { subs.len().await == 1 }
    })
    .await;
    timeout(WAIT, forward_state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(upstream.publish("{\"matchId\":7}".to_string()).await, Delivery::Sent);
    assert_eq!(next_text(&mut display).await, "{\"matchId\":7}");
    assert_eq!(downstream.stats().inbound.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[tokio::test]
async fn follower_reads_upstream_subscriber_feed() {
    let subs = Arc::new(Broadcaster::new(16));
    let addr = serve_subscribers(&subs).await;

    let (tx, mut rx) = mpsc::channel(16);
    tokio::spawn(follow_upstream(format!("ws://{addr}"), Duration::from_millis(50), tx));
    eventually("follower connected", || {
        let subs = Arc::clone(&subs);
        async move { subs.len().await == 1 }
    })
    .await;

    subs.broadcast("snapshot").await;
    let got = timeout(WAIT, rx.recv()).await.unwrap();
    assert_eq!(got.as_deref(), Some("snapshot"));
}
