use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Subscribes to a stage and prints every message, one per line.
#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let url = std::env::var("RELAY_PROBE_URL").unwrap_or_else(|_| "ws://127.0.0.1:7300".to_string());

    let (ws, _resp) = connect_async(url.as_str())
        .await
        .with_context(|| format!("connect to {url}"))?;
    eprintln!("connected to {url}");
    let (mut sink, mut stream) = ws.split();

    while let Some(msg) = stream.next().await {
        match msg.context("recv")? {
            Message::Text(t) => println!("{}", t),
            Message::Ping(payload) => {
                let _ = sink.send(Message::Pong(payload)).await;
            }
            Message::Close(frame) => {
                eprintln!("closed by stage: {:?}", frame);
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
