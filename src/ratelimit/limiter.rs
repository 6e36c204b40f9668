//! Hybrid sliding-window and token-bucket decision engine.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::clock::Clock;
use super::decision::{Decision, DenialStage};
use super::keys::KeySpace;
use super::limits::LimiterConfig;
use crate::error::{Result, SluiceError};
use crate::store::{Commit, CounterStore, Snapshot};

/// Upper bound on snapshot/commit rounds for a single decision.
const MAX_COMMIT_ATTEMPTS: u32 = 16;
/// Back-off ceiling per attempt, scaled by the attempt number.
const BACKOFF_STEP_MICROS: u64 = 500;

/// Token state to persist when a request is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TokenState {
    pub tokens: i64,
    pub last_refill: i64,
}

/// Result of running the algorithm against one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Evaluation {
    pub decision: Decision,
    /// Present only when the request is admitted
    pub admit: Option<TokenState>,
}

/// Decide one request against a snapshot of the key's state.
///
/// The window stage runs first and short-circuits; the token stage only sees
/// requests that already fit in the window. Nothing is persisted for a denial.
pub(crate) fn evaluate(config: &LimiterConfig, now: i64, snapshot: &Snapshot) -> Evaluation {
    let max_window = config.max_window();
    let window = signed(config.window_secs());
    let refill = signed(config.refill_secs());
    let bucket = signed(config.bucket_size());

    let mut decision = Decision {
        allowed: false,
        limit: max_window,
        remaining: 0,
        reset_at: now.saturating_add(window),
        window_secs: config.window_secs(),
        bucket_size: config.bucket_size(),
        retry_after: None,
        denied_by: None,
    };

    if snapshot.window_count >= max_window {
        decision.retry_after = Some(config.refill_secs());
        decision.denied_by = Some(DenialStage::Window);
        return Evaluation {
            decision,
            admit: None,
        };
    }
    let remaining = max_window - (snapshot.window_count + 1);

    // Absent state means a fresh key: full bucket, refill clock starting now.
    let mut tokens = snapshot.tokens.map_or(bucket, |t| t.clamp(0, bucket));
    let mut last_refill = snapshot.last_refill.unwrap_or(now);

    // Stored timestamps come from other writers and may be arbitrary.
    let intervals = now.saturating_sub(last_refill).max(0) / refill;
    if intervals > 0 {
        tokens = tokens.saturating_add(intervals).min(bucket);
        last_refill += intervals * refill;
    }

    if tokens <= 0 {
        decision.retry_after = Some(config.refill_secs());
        decision.denied_by = Some(DenialStage::Bucket);
        return Evaluation {
            decision,
            admit: None,
        };
    }

    decision.allowed = true;
    decision.remaining = remaining;
    Evaluation {
        decision,
        admit: Some(TokenState {
            tokens: tokens - 1,
            last_refill,
        }),
    }
}

fn signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// A decision engine bound to one immutable configuration.
///
/// The engine holds no per-key state of its own; everything lives in the
/// shared store, so any number of engines (in any number of processes) can
/// enforce the same limit.
pub struct HybridLimiter {
    config: LimiterConfig,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
}

impl HybridLimiter {
    /// Create an engine for `config` over `store`.
    pub fn new(config: LimiterConfig, store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
            key_prefix: String::new(),
        }
    }

    /// Namespace every store key under `prefix`.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// The configuration this engine enforces.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Store keys used for `client`.
    pub fn keys(&self, client: &str) -> KeySpace {
        KeySpace::new(&self.key_prefix, client)
    }

    /// Decide whether a request from `client` may proceed.
    ///
    /// Admission is committed with an optimistic revision check. When another
    /// writer commits for the same key in between, the whole decision is
    /// recomputed from fresh state, so two racing callers can never both take
    /// the last slot. Store failures abort the call.
    pub async fn allow(&self, client: &str) -> Result<Decision> {
        let keys = self.keys(client);
        let window = signed(self.config.window_secs());

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let now = self.clock.now_secs();
            let snapshot = self.store.snapshot(&keys, now.saturating_sub(window)).await?;
            let evaluation = evaluate(&self.config, now, &snapshot);

            let Some(admit) = evaluation.admit else {
                debug!(
                    key = %keys,
                    stage = ?evaluation.decision.denied_by,
                    window_count = snapshot.window_count,
                    "Request denied"
                );
                return Ok(evaluation.decision);
            };

            let commit = Commit {
                log_member: format!("{}-{}", now, Uuid::new_v4()),
                log_score: now,
                // An entry exactly `window` old still counts, so the log must outlive it.
                log_ttl_secs: self.config.window_secs() + 1,
                tokens: admit.tokens,
                last_refill: admit.last_refill,
                state_ttl_secs: self.config.state_ttl_secs(),
            };

            if self.store.commit(&keys, snapshot.revision, &commit).await? {
                trace!(
                    key = %keys,
                    remaining = evaluation.decision.remaining,
                    tokens = admit.tokens,
                    "Request admitted"
                );
                return Ok(evaluation.decision);
            }

            trace!(key = %keys, attempt, "Concurrent update, recomputing decision");
            let delay = {
                let mut rng = rand::thread_rng();
                rng.gen_range(0..=attempt as u64 * BACKOFF_STEP_MICROS)
            };
            tokio::time::sleep(Duration::from_micros(delay)).await;
        }

        warn!(
            key = %keys,
            attempts = MAX_COMMIT_ATTEMPTS,
            "Giving up on contended key"
        );
        Err(SluiceError::Contention(MAX_COMMIT_ATTEMPTS))
    }
}

/// Builds engines that share one store, clock and key namespace.
#[derive(Clone)]
pub struct LimiterFactory {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
}

impl LimiterFactory {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            key_prefix: String::new(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Construct an engine for `config`.
    pub fn build(&self, config: LimiterConfig) -> HybridLimiter {
        HybridLimiter::new(config, self.store.clone(), self.clock.clone())
            .with_key_prefix(self.key_prefix.clone())
    }
}
