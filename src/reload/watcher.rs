//! Startup configuration and live reconfiguration of the active limiter.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::source::{ConfigSource, PayloadStream};
use crate::error::{Result, SluiceError};
use crate::ratelimit::{LimiterConfig, LimiterFactory, LimiterRegistry};

/// Fetch the initial configuration and install the first engine.
///
/// Failure here is fatal for the service: without a valid initial
/// configuration there is nothing to enforce.
pub async fn bootstrap(
    source: &dyn ConfigSource,
    registry: &LimiterRegistry,
    factory: &LimiterFactory,
) -> Result<LimiterConfig> {
    info!(source = %source.describe(), "Loading initial limiter configuration");

    let payload = source
        .fetch()
        .await
        .map_err(|e| SluiceError::SourceUnavailable(e.to_string()))?
        .ok_or_else(|| {
            SluiceError::SourceUnavailable(format!(
                "no configuration found in {}",
                source.describe()
            ))
        })?;

    let config = LimiterConfig::from_json(&payload)?;
    registry.set(Arc::new(factory.build(config)));
    Ok(config)
}

/// Applies configuration changes to the registry as they arrive.
pub struct ConfigWatcher {
    source: Arc<dyn ConfigSource>,
    registry: Arc<LimiterRegistry>,
    factory: LimiterFactory,
}

impl ConfigWatcher {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        registry: Arc<LimiterRegistry>,
        factory: LimiterFactory,
    ) -> Self {
        Self {
            source,
            registry,
            factory,
        }
    }

    /// Run the watch loop over `updates` on its own task.
    ///
    /// Take `updates` from the source's `watch()` before the [`bootstrap`]
    /// fetch: a change published between the two is then still delivered,
    /// while one the bootstrap already saw is skipped as unchanged.
    pub fn spawn(self, updates: PayloadStream) -> JoinHandle<()> {
        tokio::spawn(self.consume(updates))
    }

    async fn consume(self, mut updates: PayloadStream) {
        info!(source = %self.source.describe(), "Watching limiter configuration");

        while let Some(update) = updates.next().await {
            match update {
                Ok(payload) => {
                    // Rejected payloads leave the previous engine in place.
                    let _ = self.apply(&payload);
                }
                Err(e) => {
                    warn!(error = %e, "Configuration watch error");
                }
            }
        }

        info!(source = %self.source.describe(), "Configuration watch stream ended");
    }

    /// Validate `payload` and install a new engine for it.
    ///
    /// Returns `Ok(false)` when the payload matches the active configuration.
    pub fn apply(&self, payload: &[u8]) -> Result<bool> {
        let config = match LimiterConfig::from_json(payload) {
            Ok(config) => config,
            Err(e) => {
                error!(
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "Rejected limiter configuration, keeping previous"
                );
                return Err(e.into());
            }
        };

        if let Some(current) = self.registry.get() {
            if *current.config() == config {
                debug!(limiter = %config, "Limiter configuration unchanged");
                return Ok(false);
            }
        }

        self.registry.set(Arc::new(self.factory.build(config)));
        Ok(true)
    }
}
