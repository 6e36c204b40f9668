//! In-process counter store.
//!
//! Mirrors the Redis data layout closely enough to exercise the engine
//! without a server: an ordered request log with expiry, scalar token state
//! with expiry, and a revision counter. Expiry is evaluated lazily against
//! the injected clock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::{Commit, CounterStore, Snapshot, StoreError};
use crate::ratelimit::{Clock, KeySpace};

/// State held for one client key.
#[derive(Debug, Default, Clone)]
struct KeyRecord {
    /// (score, member) pairs; members are unique
    log: Vec<(i64, String)>,
    log_expires_at: Option<i64>,
    tokens: Option<i64>,
    last_refill: Option<i64>,
    revision: u64,
    state_expires_at: Option<i64>,
}

impl KeyRecord {
    fn expire(&mut self, now: i64) {
        if self.log_expires_at.is_some_and(|at| now >= at) {
            self.log.clear();
            self.log_expires_at = None;
        }
        if self.state_expires_at.is_some_and(|at| now >= at) {
            self.tokens = None;
            self.last_refill = None;
            self.revision = 0;
            self.state_expires_at = None;
        }
    }

    /// Whether nothing in the record is live at `now`, so it can be dropped.
    fn is_idle(&self, now: i64) -> bool {
        let log_gone = self.log.is_empty() || self.log_expires_at.is_some_and(|at| now >= at);
        let state_gone = (self.tokens.is_none() && self.last_refill.is_none())
            || self.state_expires_at.is_some_and(|at| now >= at);
        log_gone && state_gone
    }
}

fn expiry(now: i64, ttl_secs: u64) -> i64 {
    now.saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX))
}

/// A [`CounterStore`] backed by a concurrent map.
pub struct MemoryStore {
    records: DashMap<String, KeyRecord>,
    clock: Arc<dyn Clock>,
    offline: AtomicBool,
    latency_micros: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store that evaluates expiry against `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
            offline: AtomicBool::new(false),
            latency_micros: AtomicU64::new(0),
        }
    }

    /// Make every subsequent operation fail as if the store were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every subsequent operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_micros
            .store(latency.as_micros() as u64, Ordering::SeqCst);
    }

    /// Number of live log entries for a client.
    pub fn log_len(&self, keys: &KeySpace) -> usize {
        self.live_record(keys).map_or(0, |r| r.log.len())
    }

    /// Stored token count for a client, if any.
    pub fn tokens(&self, keys: &KeySpace) -> Option<i64> {
        self.live_record(keys).and_then(|r| r.tokens)
    }

    /// Stored refill timestamp for a client, if any.
    pub fn last_refill(&self, keys: &KeySpace) -> Option<i64> {
        self.live_record(keys).and_then(|r| r.last_refill)
    }

    /// Overwrite the token state for a client, bumping its revision like any
    /// other writer would.
    pub fn put_tokens(&self, keys: &KeySpace, tokens: i64, last_refill: i64, ttl_secs: u64) {
        let now = self.clock.now_secs();
        let mut record = self.records.entry(keys.log.clone()).or_default();
        record.expire(now);
        record.tokens = Some(tokens);
        record.last_refill = Some(last_refill);
        record.revision += 1;
        record.state_expires_at = Some(expiry(now, ttl_secs));
    }

    /// Number of client records currently held.
    pub fn key_count(&self) -> usize {
        self.records.len()
    }

    /// Drop every record whose log and token state have both expired.
    ///
    /// Returns the number of records removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_secs();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_idle(now));
        before.saturating_sub(self.records.len())
    }

    /// Run [`purge_expired`](Self::purge_expired) every `period` until the
    /// store is dropped.
    pub fn spawn_sweeper(store: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.purge_expired();
                if removed > 0 {
                    debug!(removed, remaining = store.key_count(), "Purged idle keys");
                }
            }
        })
    }

    fn live_record(&self, keys: &KeySpace) -> Option<KeyRecord> {
        let now = self.clock.now_secs();
        self.records.get(&keys.log).map(|r| {
            let mut record = r.clone();
            record.expire(now);
            record
        })
    }

    async fn before_operation(&self) -> Result<(), StoreError> {
        let micros = self.latency_micros.load(Ordering::SeqCst);
        if micros > 0 {
            tokio::time::sleep(Duration::from_micros(micros)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn snapshot(&self, keys: &KeySpace, prune_before: i64) -> Result<Snapshot, StoreError> {
        self.before_operation().await?;
        let now = self.clock.now_secs();

        let snapshot = {
            let Some(mut record) = self.records.get_mut(&keys.log) else {
                return Ok(Snapshot::default());
            };
            record.expire(now);
            record.log.retain(|(score, _)| *score >= prune_before);

            Snapshot {
                window_count: record.log.len() as u64,
                tokens: record.tokens,
                last_refill: record.last_refill,
                revision: record.revision,
            }
        };

        // An idle record reads the same as a missing one.
        if snapshot == Snapshot::default() {
            self.records.remove_if(&keys.log, |_, record| record.is_idle(now));
        }
        trace!(key = %keys, ?snapshot, "Memory snapshot");
        Ok(snapshot)
    }

    async fn commit(
        &self,
        keys: &KeySpace,
        expected_revision: u64,
        commit: &Commit,
    ) -> Result<bool, StoreError> {
        self.before_operation().await?;
        let now = self.clock.now_secs();

        let mut record = self.records.entry(keys.log.clone()).or_default();
        record.expire(now);
        if record.revision != expected_revision {
            trace!(
                key = %keys,
                expected = expected_revision,
                actual = record.revision,
                "Memory commit conflict"
            );
            return Ok(false);
        }

        record.log.push((commit.log_score, commit.log_member.clone()));
        record.log_expires_at = Some(expiry(now, commit.log_ttl_secs));
        record.tokens = Some(commit.tokens);
        record.last_refill = Some(commit.last_refill);
        record.revision += 1;
        record.state_expires_at = Some(expiry(now, commit.state_ttl_secs));
        Ok(true)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.before_operation().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;

    fn commit_at(score: i64, member: &str) -> Commit {
        Commit {
            log_member: member.to_string(),
            log_score: score,
            log_ttl_secs: 60,
            tokens: 4,
            last_refill: score,
            state_ttl_secs: 120,
        }
    }

    fn store_at(now: i64) -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(now));
        let store = MemoryStore::new(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_snapshot_of_unknown_key_is_empty() {
        let (_clock, store) = store_at(1_000);
        let keys = KeySpace::new("", "nobody");

        let snapshot = store.snapshot(&keys, 940).await.unwrap();
        assert_eq!(snapshot, Snapshot::default());
    }

    #[tokio::test]
    async fn test_commit_then_snapshot() {
        let (_clock, store) = store_at(1_000);
        let keys = KeySpace::new("", "k");

        assert!(store.commit(&keys, 0, &commit_at(1_000, "a")).await.unwrap());

        let snapshot = store.snapshot(&keys, 940).await.unwrap();
        assert_eq!(snapshot.window_count, 1);
        assert_eq!(snapshot.tokens, Some(4));
        assert_eq!(snapshot.last_refill, Some(1_000));
        assert_eq!(snapshot.revision, 1);
    }

    #[tokio::test]
    async fn test_stale_revision_is_rejected() {
        let (_clock, store) = store_at(1_000);
        let keys = KeySpace::new("", "k");

        assert!(store.commit(&keys, 0, &commit_at(1_000, "a")).await.unwrap());
        assert!(!store.commit(&keys, 0, &commit_at(1_000, "b")).await.unwrap());
        assert_eq!(store.log_len(&keys), 1);
    }

    #[tokio::test]
    async fn test_prune_keeps_entry_on_boundary() {
        let (_clock, store) = store_at(1_000);
        let keys = KeySpace::new("", "k");

        store.commit(&keys, 0, &commit_at(939, "old")).await.unwrap();
        store.commit(&keys, 1, &commit_at(940, "edge")).await.unwrap();
        store.commit(&keys, 2, &commit_at(999, "new")).await.unwrap();

        let snapshot = store.snapshot(&keys, 940).await.unwrap();
        assert_eq!(snapshot.window_count, 2);
    }

    #[tokio::test]
    async fn test_state_expires_with_ttl() {
        let (clock, store) = store_at(1_000);
        let keys = KeySpace::new("", "k");
        store.commit(&keys, 0, &commit_at(1_000, "a")).await.unwrap();

        clock.advance(60);
        let snapshot = store.snapshot(&keys, 0).await.unwrap();
        assert_eq!(snapshot.window_count, 0);
        assert_eq!(snapshot.tokens, Some(4));

        clock.advance(60);
        let snapshot = store.snapshot(&keys, 0).await.unwrap();
        assert_eq!(snapshot, Snapshot::default());
    }

    #[tokio::test]
    async fn test_snapshot_drops_idle_records() {
        let (clock, store) = store_at(1_000);
        for i in 0..1_000 {
            let keys = KeySpace::new("", &format!("client-{i}"));
            let mut commit = commit_at(1_000, "a");
            commit.log_ttl_secs = 1;
            commit.state_ttl_secs = 1;
            store.commit(&keys, 0, &commit).await.unwrap();
        }
        assert_eq!(store.key_count(), 1_000);

        clock.advance(10_000);
        for i in 0..1_000 {
            let keys = KeySpace::new("", &format!("client-{i}"));
            assert_eq!(
                store.snapshot(&keys, 0).await.unwrap(),
                Snapshot::default()
            );
        }
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_purge_keeps_live_records() {
        let (clock, store) = store_at(1_000);
        let short = KeySpace::new("", "short");
        let long = KeySpace::new("", "long");

        let mut commit = commit_at(1_000, "a");
        commit.log_ttl_secs = 5;
        commit.state_ttl_secs = 5;
        store.commit(&short, 0, &commit).await.unwrap();
        store.commit(&long, 0, &commit_at(1_000, "b")).await.unwrap();

        // Log expired, token state still live.
        clock.advance(60);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.tokens(&long), Some(4));

        clock.advance(60);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_purges_in_background() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let keys = KeySpace::new("", "k");
        store.commit(&keys, 0, &commit_at(1_000, "a")).await.unwrap();

        let sweeper = MemoryStore::spawn_sweeper(&store, Duration::from_millis(5));
        clock.advance(1_000);

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.key_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("idle record should be purged");

        drop(store);
        tokio::time::timeout(Duration::from_secs(2), sweeper)
            .await
            .expect("sweeper should stop once the store is gone")
            .unwrap();
    }

    #[tokio::test]
    async fn test_offline_store_fails_every_operation() {
        let (_clock, store) = store_at(1_000);
        let keys = KeySpace::new("", "k");
        store.set_offline(true);

        assert!(matches!(
            store.snapshot(&keys, 0).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.commit(&keys, 0, &commit_at(1_000, "a")).await.is_err());
        assert!(store.ping().await.is_err());

        store.set_offline(false);
        assert!(store.ping().await.is_ok());
    }
}
