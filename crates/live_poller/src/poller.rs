//! Match poller: one independent fetch → decode → update → publish per
//! tracked match, every cycle.

use logger::{now_iso, EventLogger, PollCycleEvent};
use market_decoder::{decode_match, DecodeError};
use relay::{Delivery, Publish};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::LiveFeed;
use crate::registry::{Match, MatchRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Published,
    /// Header-only record (no market array), still published.
    Incomplete,
    /// Provider returned `[]`; match skipped this cycle.
    Empty,
    Malformed,
    FetchFailed,
    /// Older than what the registry already holds; not published.
    Stale,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub matches:      usize,
    pub published:    usize,
    pub incomplete:   usize,
    pub empty:        usize,
    pub malformed:    usize,
    pub fetch_failed: usize,
    pub stale:        usize,
    /// Per-match tasks that panicked.
    pub task_failed:  usize,
    pub elapsed_ms:   u64,
}

impl CycleReport {
    fn record(&mut self, outcome: PollOutcome) {
        match outcome {
            PollOutcome::Published   => self.published += 1,
            PollOutcome::Incomplete  => self.incomplete += 1,
            PollOutcome::Empty       => self.empty += 1,
            PollOutcome::Malformed   => self.malformed += 1,
            PollOutcome::FetchFailed => self.fetch_failed += 1,
            PollOutcome::Stale       => self.stale += 1,
        }
    }
}

pub struct MatchPoller {
    registry:       Arc<MatchRegistry>,
    feed:           Arc<dyn LiveFeed>,
    sinks:          Vec<Arc<dyn Publish>>,
    full_snapshots: bool,
    in_flight:      Semaphore,
}

impl MatchPoller {
    pub fn new(
        registry: Arc<MatchRegistry>,
        feed: Arc<dyn LiveFeed>,
        sinks: Vec<Arc<dyn Publish>>,
        max_in_flight: usize,
        full_snapshots: bool,
    ) -> Self {
        Self {
            registry,
            feed,
            sinks,
            full_snapshots,
            in_flight: Semaphore::new(max_in_flight.max(1)),
        }
    }

    async fn poll_match(&self, m: Match) -> PollOutcome {
        let Ok(_permit) = self.in_flight.acquire().await else {
            return PollOutcome::FetchFailed;
        };

        let cursor = if self.full_snapshots { 0 } else { m.refresh_key };
        let payload = match self.feed.fetch_match(cursor, m.match_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!("match {} fetch failed: {}", m.match_id, e);
                return PollOutcome::FetchFailed;
            }
        };

        let odds = match decode_match(m.match_id, &payload) {
            Ok(o) => o,
            Err(DecodeError::EmptyFeed) => return PollOutcome::Empty,
            Err(e) => {
                warn!("match {} skipped: {}", m.match_id, e);
                return PollOutcome::Malformed;
            }
        };

        let applied = self
            .registry
            .update(Match {
                match_id: m.match_id,
                refresh_key: odds.refresh_key,
                league_name: odds.league_name.clone(),
                match_name: odds.match_name.clone(),
            })
            .await;
        if !applied {
            debug!("match {} refreshKey {} is behind the registry; not published", m.match_id, odds.refresh_key);
            return PollOutcome::Stale;
        }

        let text = match serde_json::to_string(&odds) {
            Ok(t) => t,
            Err(e) => {
                warn!("match {} serialize failed: {}", m.match_id, e);
                return PollOutcome::Malformed;
            }
        };

        for sink in &self.sinks {
            if sink.publish(text.clone()).await == Delivery::Dropped {
                debug!("match {} not delivered to one sink", m.match_id);
            }
        }

        if odds.incomplete_markets {
            PollOutcome::Incomplete
        } else {
            debug!("match {} {} published ({} lines)", m.match_id, odds.match_name, odds.line_count());
            PollOutcome::Published
        }
    }

    /// Polls every tracked match once. A failing or panicking match never
    /// affects the others.
    pub async fn run_cycle(self: &Arc<Self>) -> CycleReport {
        let started = Instant::now();
        let matches = self.registry.snapshot().await;
        let mut report = CycleReport { matches: matches.len(), ..CycleReport::default() };

        let mut tasks = JoinSet::new();
        for m in matches {
            let this = Arc::clone(self);
            tasks.spawn(async move { this.poll_match(m).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    warn!("match poll task failed: {}", e);
                    report.task_failed += 1;
                }
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        report
    }

    /// Starts a cycle every `interval`. A slow cycle does not hold back the
    /// next one; the registry's refresh-key guard keeps overlapping results
    /// from regressing.
    pub async fn run(self: Arc<Self>, interval: Duration, logger: Arc<EventLogger>) {
        info!("match poller starting — every {:?}, full_snapshots={}", interval, self.full_snapshots);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let this = Arc::clone(&self);
            let logger = Arc::clone(&logger);

            tokio::spawn(async move {
                let r = this.run_cycle().await;
                let ev = PollCycleEvent {
                    ts: now_iso(),
                    event: "POLL_CYCLE",
                    matches: r.matches,
                    published: r.published,
                    incomplete: r.incomplete,
                    empty: r.empty,
                    malformed: r.malformed,
                    fetch_failed: r.fetch_failed,
                    stale: r.stale,
                    task_failed: r.task_failed,
                    elapsed_ms: r.elapsed_ms,
                };
                let _ = logger.log(&ev);

                if r.matches > 0 {
                    info!(
                        "poll cycle: {} matches → {} published, {} incomplete, {} empty, {} malformed, {} fetch err, {} stale, {} task err ({} ms)",
                        r.matches, r.published, r.incomplete, r.empty, r.malformed,
                        r.fetch_failed, r.stale, r.task_failed, r.elapsed_ms
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FetchError;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Canned detail responses keyed by match id. `queued` answers are
    /// served once each, in order, before falling back to `details`.
    #[derive(Default)]
    struct ScriptedFeed {
        details: HashMap<i64, Value>,
        queued:  Mutex<HashMap<i64, VecDeque<Value>>>,
        calls:   Mutex<Vec<(i64, i64)>>,
    }

    const PANICS: i64 = 666;
    const UNREACHABLE: i64 = 503;

    #[async_trait]
    impl LiveFeed for ScriptedFeed {
        async fn fetch_all(&self, _cursor: i64) -> Result<Value, FetchError> {
            Ok(json!([]))
        }

        async fn fetch_match(&self, cursor: i64, match_id: i64) -> Result<Value, FetchError> {
            self.calls.lock().unwrap().push((match_id, cursor));
            if match_id == PANICS {
                panic!("provider shape blew up");
            }
            if match_id == UNREACHABLE {
                return Err(FetchError::Status(503));
            }
            if let Some(next) = self.queued.lock().unwrap().get_mut(&match_id).and_then(VecDeque::pop_front) {
                return Ok(next);
            }
            Ok(self.details.get(&match_id).cloned().unwrap_or_else(|| json!([])))
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    #[async_trait]
    impl Publish for Collect {
        async fn publish(&self, text: String) -> Delivery {
            self.0.lock().unwrap().push(text);
            Delivery::Sent
        }
    }

    fn detail(slid: i64, name: &str, markets: Value) -> Value {
        json!([{ "H": { "LigaNaziv": "Serbia - Super Liga", "SLID": slid, "ParNaziv": name }, "M": markets }])
    }

    async fn setup(
        feed: ScriptedFeed,
        ids: &[i64],
        full_snapshots: bool,
    ) -> (Arc<MatchPoller>, Arc<MatchRegistry>, Arc<ScriptedFeed>, Arc<Collect>) {
        let registry = Arc::new(MatchRegistry::new());
        for &id in ids {
            registry.upsert_if_absent(Match::discovered(id)).await;
        }
        let feed = Arc::new(feed);
        let sink = Arc::new(Collect::default());
        let poller = Arc::new(MatchPoller::new(
            Arc::clone(&registry),
            feed.clone(),
            vec![sink.clone() as Arc<dyn Publish>],
            4,
            full_snapshots,
        ));
        (poller, registry, feed, sink)
    }

    #[tokio::test]
    async fn one_bad_match_does_not_affect_the_others() {
        let mut feed = ScriptedFeed::default();
        feed.details.insert(1, detail(101, "Partizan - Vojvodina", json!([ { "S": [ { "N": 1, "O": 1.63 } ] } ])));
        feed.details.insert(2, detail(102, "TSC - Cukaricki", json!([])));
        feed.details.insert(3, json!([{ "H": { "SLID": 1 } }]));
        // 4 has no canned detail → []

        let (poller, registry, _, sink) = setup(feed, &[1, 2, 3, 4, PANICS, UNREACHABLE], false).await;
        let report = poller.run_cycle().await;

        assert_eq!(report.matches, 6);
        assert_eq!(report.published, 1);
        assert_eq!(report.incomplete, 1);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.empty, 1);
        assert_eq!(report.fetch_failed, 1);
        assert_eq!(report.task_failed, 1);

        let sent = sink.0.lock().unwrap();
        assert_eq!(sent.len(), 2);
        let names: Vec<String> = sent
            .iter()
            .map(|t| serde_json::from_str::<Value>(t).unwrap()["matchName"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"Partizan - Vojvodina".to_string()));
        assert!(names.contains(&"TSC - Cukaricki".to_string()));
        drop(sent);

        let m1 = registry.get(1).await.unwrap();
        assert_eq!(m1.refresh_key, 101);
        assert_eq!(m1.league_name, "Serbia - Super Liga");
        assert_eq!(registry.get(4).await.unwrap().refresh_key, 0);
    }

    #[tokio::test]
    async fn next_cycle_uses_stored_refresh_key() {
        let mut feed = ScriptedFeed::default();
        feed.details.insert(8, detail(4242, "A - B", json!([])));

        let (poller, _, feed, _) = setup(feed, &[8], false).await;
        poller.run_cycle().await;
        poller.run_cycle().await;

        assert_eq!(*feed.calls.lock().unwrap(), vec![(8, 0), (8, 4242)]);
    }

    #[tokio::test]
    async fn full_snapshot_mode_always_sends_cursor_zero() {
        let mut feed = ScriptedFeed::default();
        feed.details.insert(8, detail(4242, "A - B", json!([])));

        let (poller, registry, feed, _) = setup(feed, &[8], true).await;
        poller.run_cycle().await;
        poller.run_cycle().await;

        assert_eq!(*feed.calls.lock().unwrap(), vec![(8, 0), (8, 0)]);
        assert_eq!(registry.get(8).await.unwrap().refresh_key, 4242);
    }

    #[tokio::test]
    async fn older_refresh_key_is_counted_stale_and_not_published() {
        let feed = ScriptedFeed::default();
        feed.queued.lock().unwrap().insert(
            5,
            VecDeque::from(vec![
                detail(200, "Partizan - Vojvodina", json!([ { "S": [ { "N": 1, "O": 1.63 } ] } ])),
                detail(150, "Partizan - Vojvodina", json!([ { "S": [ { "N": 1, "O": 2.10 } ] } ])),
            ]),
        );

        let (poller, registry, feed, sink) = setup(feed, &[5], false).await;
        let first = poller.run_cycle().await;
        let second = poller.run_cycle().await;

        assert_eq!(first.published, 1);
        assert_eq!(second.published, 0);
        assert_eq!(second.stale, 1);
        assert_eq!(*feed.calls.lock().unwrap(), vec![(5, 0), (5, 200)]);

        let keys: Vec<i64> = sink
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|t| serde_json::from_str::<Value>(t).unwrap()["refreshKey"].as_i64().unwrap())
            .collect();
        assert_eq!(keys, vec![200]);
        assert_eq!(registry.get(5).await.unwrap().refresh_key, 200);
    }

    #[tokio::test]
    async fn empty_registry_is_a_quiet_cycle() {
        let (poller, _, _, sink) = setup(ScriptedFeed::default(), &[], false).await;
        let report = poller.run_cycle().await;
        assert_eq!(report.matches, 0);
        assert!(sink.0.lock().unwrap().is_empty());
    }
}
