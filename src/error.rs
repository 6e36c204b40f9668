//! Error types for the Sluice service.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::ConfigError;
use crate::store::StoreError;

/// Main error type for Sluice operations.
#[derive(Error, Debug)]
pub enum SluiceError {
    /// Limiter configuration failed validation
    #[error("Invalid limiter configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Any failure talking to the shared counter store
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// The configuration source could not supply a configuration
    #[error("Configuration source unavailable: {0}")]
    SourceUnavailable(String),

    /// No limiter has been installed yet
    #[error("Rate limiter has not been initialized")]
    Uninitialized,

    /// The caller's deadline expired before a decision was reached
    #[error("Admission deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// Concurrent writers kept invalidating the optimistic commit
    #[error("Gave up after {0} conflicting updates")]
    Contention(u32),

    /// Service settings errors
    #[error("Configuration error: {0}")]
    Settings(String),
}

/// Result type alias for Sluice operations.
pub type Result<T> = std::result::Result<T, SluiceError>;
