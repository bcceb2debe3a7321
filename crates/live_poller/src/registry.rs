use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// One tracked live match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub match_id:    i64,
    /// Provider cursor for incremental detail; 0 until the first fetch lands.
    pub refresh_key: i64,
    pub league_name: String,
    pub match_name:  String,
}

impl Match {
    pub fn discovered(match_id: i64) -> Self {
        Self {
            match_id,
            refresh_key: 0,
            league_name: String::new(),
            match_name: String::new(),
        }
    }
}

/// Tracked matches keyed by id. The lock is only ever held for map access.
#[derive(Debug, Default)]
pub struct MatchRegistry {
    matches: RwLock<HashMap<i64, Match>>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `seed` unless the id is already tracked. Returns true on insert.
    pub async fn upsert_if_absent(&self, seed: Match) -> bool {
        let mut map = self.matches.write().await;
        if map.contains_key(&seed.match_id) {
            return false;
        }
        map.insert(seed.match_id, seed);
        true
    }

    /// Point-in-time copy, ordered by match id.
    pub async fn snapshot(&self) -> Vec<Match> {
        let mut all: Vec<Match> = self.matches.read().await.values().cloned().collect();
        all.sort_by_key(|m| m.match_id);
        all
    }

    /// Replaces the stored record unless it would move the refresh key
    /// backwards (a slow fetch finishing after a newer one). Returns true
    /// when applied.
    pub async fn update(&self, next: Match) -> bool {
        let mut map = self.matches.write().await;
        match map.get_mut(&next.match_id) {
            Some(current) if next.refresh_key < current.refresh_key => false,
            Some(current) => {
                *current = next;
                true
            }
            None => {
                map.insert(next.match_id, next);
                true
            }
        }
    }

    pub async fn get(&self, match_id: i64) -> Option<Match> {
        self.matches.read().await.get(&match_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.matches.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.matches.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn named(id: i64, key: i64, name: &str) -> Match {
        Match {
            match_id: id,
            refresh_key: key,
            league_name: "League".to_string(),
            match_name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn discovery_insert_is_idempotent_and_keeps_first_seen() {
        let reg = MatchRegistry::new();
        assert!(reg.upsert_if_absent(named(10, 0, "first")).await);
        assert!(!reg.upsert_if_absent(named(10, 0, "second")).await);

        assert_eq!(reg.len().await, 1);
        assert_eq!(reg.get(10).await.unwrap().match_name, "first");
    }

    #[tokio::test]
    async fn update_never_moves_refresh_key_backwards() {
        let reg = MatchRegistry::new();
        reg.upsert_if_absent(Match::discovered(5)).await;

        assert!(reg.update(named(5, 200, "newer")).await);
        assert!(!reg.update(named(5, 150, "stale")).await);
        assert!(reg.update(named(5, 200, "same key")).await);

        let stored = reg.get(5).await.unwrap();
        assert_eq!(stored.refresh_key, 200);
        assert_eq!(stored.match_name, "same key");
    }

    #[tokio::test]
    async fn snapshot_is_a_detached_copy() {
        let reg = MatchRegistry::new();
        for id in [3, 1, 2] {
            reg.upsert_if_absent(Match::discovered(id)).await;
        }

        let snap = reg.snapshot().await;
        reg.update(named(1, 9, "changed")).await;

        let ids: Vec<i64> = snap.iter().map(|m| m.match_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(snap[0].refresh_key, 0);
    }

    #[tokio::test]
    async fn concurrent_discovery_and_updates_converge() {
        let reg = Arc::new(MatchRegistry::new());
        let mut tasks = tokio::task::JoinSet::new();

        for id in 0..50i64 {
            let reg = Arc::clone(&reg);
            tasks.spawn(async move {
                reg.upsert_if_absent(Match::discovered(id % 10)).await;
                reg.update(named(id % 10, id, "x")).await;
            });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(reg.len().await, 10);
        for m in reg.snapshot().await {
            // highest key for each id is 40 + id
            assert_eq!(m.refresh_key, 40 + m.match_id);
        }
    }
}
