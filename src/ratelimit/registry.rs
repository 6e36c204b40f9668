//! Holder of the currently active decision engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::info;

use super::limiter::HybridLimiter;

/// Process-wide slot for "the current engine".
///
/// Readers take a cheap snapshot of the `Arc`; a reconfiguration swaps the
/// pointer. A call that already holds an engine keeps using it until it
/// finishes, so its configuration can never change mid-decision.
#[derive(Default)]
pub struct LimiterRegistry {
    current: ArcSwapOption<HybridLimiter>,
    generation: AtomicU64,
}

impl LimiterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The active engine, or `None` before the first [`set`](Self::set).
    pub fn get(&self) -> Option<Arc<HybridLimiter>> {
        self.current.load_full()
    }

    /// Install `limiter` as the active engine and return the new generation.
    pub fn set(&self, limiter: Arc<HybridLimiter>) -> u64 {
        let config = *limiter.config();
        let previous = self.current.swap(Some(limiter));
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        info!(
            generation,
            limiter = %config,
            replaced = previous.is_some(),
            "Installed rate limiter"
        );
        generation
    }

    /// Whether an engine has been installed.
    pub fn is_initialized(&self) -> bool {
        self.current.load().is_some()
    }

    /// Number of engines installed so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{LimiterConfig, LimiterFactory, ManualClock};
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn factory() -> LimiterFactory {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        LimiterFactory::new(store, clock)
    }

    fn config(max_window: u64) -> LimiterConfig {
        LimiterConfig::new(
            Duration::from_secs(60),
            max_window,
            10,
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_registry_starts_uninitialized() {
        let registry = LimiterRegistry::new();

        assert!(registry.get().is_none());
        assert!(!registry.is_initialized());
        assert_eq!(registry.generation(), 0);
    }

    #[test]
    fn test_set_replaces_engine() {
        let registry = LimiterRegistry::new();
        let factory = factory();

        assert_eq!(registry.set(Arc::new(factory.build(config(1)))), 1);
        assert_eq!(registry.get().unwrap().config().max_window(), 1);

        assert_eq!(registry.set(Arc::new(factory.build(config(2)))), 2);
        assert_eq!(registry.get().unwrap().config().max_window(), 2);
        assert!(registry.is_initialized());
    }

    #[tokio::test]
    async fn test_held_engine_survives_swap() {
        let registry = LimiterRegistry::new();
        let factory = factory();
        registry.set(Arc::new(factory.build(config(1))));

        let in_flight = registry.get().unwrap();
        registry.set(Arc::new(factory.build(config(3))));

        // The held engine still enforces its own configuration.
        assert_eq!(in_flight.config().max_window(), 1);
        assert!(in_flight.allow("k").await.unwrap().allowed);
        assert!(!in_flight.allow("k").await.unwrap().allowed);

        // The new engine picks up the log the old one left behind.
        let current = registry.get().unwrap();
        let decision = current.allow("k").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_always_see_a_whole_engine() {
        let registry = Arc::new(LimiterRegistry::new());
        let factory = factory();
        registry.set(Arc::new(factory.build(config(1))));

        let mut readers = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..1_000 {
                    let engine = registry.get().expect("registry was initialized");
                    let max_window = engine.config().max_window();
                    assert!((1..=50).contains(&max_window));
                    tokio::task::yield_now().await;
                }
            }));
        }

        for max_window in 2..=50 {
            registry.set(Arc::new(factory.build(config(max_window))));
            tokio::task::yield_now().await;
        }

        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(registry.generation(), 50);
    }
}
