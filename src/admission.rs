//! The boundary between request handling and the decision engine.

use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};

use crate::error::{Result, SluiceError};
use crate::ratelimit::{Decision, LimiterRegistry};

/// Runs admission checks against whatever engine is currently installed.
#[derive(Clone)]
pub struct Admission {
    registry: Arc<LimiterRegistry>,
    deadline: Duration,
}

impl Admission {
    /// Create an admission gate; every check must finish within `deadline`.
    pub fn new(registry: Arc<LimiterRegistry>, deadline: Duration) -> Self {
        Self { registry, deadline }
    }

    /// Decide whether a request from `key` may proceed.
    ///
    /// Fails closed: with no engine installed the call errors instead of
    /// admitting. When the deadline expires the in-flight store operations
    /// are dropped along with the future running them.
    #[instrument(skip(self), fields(deadline_ms = self.deadline.as_millis() as u64))]
    pub async fn check(&self, key: &str) -> Result<Decision> {
        let Some(limiter) = self.registry.get() else {
            warn!("Admission check before limiter initialization");
            return Err(SluiceError::Uninitialized);
        };

        match tokio::time::timeout(self.deadline, limiter.allow(key)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Admission check exceeded its deadline");
                Err(SluiceError::DeadlineExceeded(self.deadline))
            }
        }
    }
}
