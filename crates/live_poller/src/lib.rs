//! Sansabet live poller
//!
//! discovery (GetAll, every N s) ──▶ MatchRegistry ──▶ poller (GetByParIDs per match)
//!                                                         └─▶ decode ─▶ Publish sinks

pub mod client;
pub mod config;
pub mod discovery;
pub mod poller;
pub mod registry;

pub use client::{FetchError, LiveFeed, SansabetClient};
pub use config::PollerConfig;
pub use discovery::{DiscoveryReport, EventDiscoverer};
pub use poller::{CycleReport, MatchPoller, PollOutcome};
pub use registry::{Match, MatchRegistry};
