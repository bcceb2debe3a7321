//! Relay hop plumbing: persistent WebSocket links between stages
//!
//! parser ──publish──▶ ingest ┐
//!                            ├─▶ RelayStage ──broadcast──▶ subscribers
//! upstream subscriber feed ──┘        └──────publish──────▶ next stage
//!
//! Payloads are opaque UTF-8 JSON texts; nothing here parses them.

pub mod broadcaster;
pub mod publisher;
pub mod source;
pub mod stage;
pub mod status;

pub use broadcaster::Broadcaster;
pub use publisher::{ConnectionState, Publisher};
pub use stage::{RelayStage, StageConfig};

use async_trait::async_trait;

/// Result of handing one message to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// No live connection (or no subscriber) took the message; it is gone.
    Dropped,
}

/// Anything a stage can push a text message into.
#[async_trait]
pub trait Publish: Send + Sync {
    async fn publish(&self, text: String) -> Delivery;
}
