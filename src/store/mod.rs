//! Shared counter store abstraction.
//!
//! All per-key limiter state lives in the store, never in the process. The
//! engine reads it with [`CounterStore::snapshot`] and writes it back with
//! [`CounterStore::commit`], which only applies if nobody else committed for
//! the same key in between.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::KeySpace;

/// Errors raised by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected value {value:?} at key {key}")]
    Corrupt { key: String, value: String },
}

/// Per-key state observed at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    /// Log entries left after pruning
    pub window_count: u64,
    /// Stored token count, `None` when the key has never been seen or expired
    pub tokens: Option<i64>,
    /// Stored refill timestamp, `None` when absent
    pub last_refill: Option<i64>,
    /// Revision the snapshot was taken at (0 when absent)
    pub revision: u64,
}

/// The writes produced by one admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Unique member recorded in the request log
    pub log_member: String,
    /// Score (admission time) of the log entry
    pub log_score: i64,
    /// Expiry applied to the request log
    pub log_ttl_secs: u64,
    /// Token count after consuming one
    pub tokens: i64,
    /// Refill timestamp to persist
    pub last_refill: i64,
    /// Expiry applied to the token state and revision
    pub state_ttl_secs: u64,
}

/// Trait for stores holding shared limiter state.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Prune log entries scored strictly below `prune_before`, then read the
    /// remaining log size, the token state and the revision, atomically.
    async fn snapshot(&self, keys: &KeySpace, prune_before: i64) -> Result<Snapshot, StoreError>;

    /// Apply `commit` if the key's revision is still `expected_revision`.
    ///
    /// Returns `false` without writing anything when the revision moved.
    async fn commit(
        &self,
        keys: &KeySpace,
        expected_revision: u64,
        commit: &Commit,
    ) -> Result<bool, StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}
