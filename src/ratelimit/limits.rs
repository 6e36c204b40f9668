//! Limiter configuration: the immutable parameters a decision engine runs with.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::duration::parse_duration;

/// Longest accepted duration, in seconds: the largest span a signed 64-bit
/// nanosecond count can express (about 292 years).
pub const MAX_DURATION_SECS: u64 = (i64::MAX as u64) / 1_000_000_000;

/// Reasons a limiter configuration is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field}: invalid duration {value:?}: {reason}")]
    InvalidDuration {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("{field}: must be at least 1s, got {value:?}")]
    TooShort { field: &'static str, value: String },
    #[error("{field}: must be at most {max}s, got {value}s", max = MAX_DURATION_SECS)]
    TooLong { field: &'static str, value: u64 },
    #[error("{field}: must be a positive integer, got {value}")]
    NotPositive { field: &'static str, value: i64 },
    #[error("malformed configuration payload: {0}")]
    Malformed(String),
}

/// The configuration payload as it is stored in the configuration source.
///
/// ```json
/// {"window_size": "60s", "max_window": 100, "bucket_size": 10, "refill_rate": "6s"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterDocument {
    /// Length of the sliding window, e.g. `"60s"`
    pub window_size: String,
    /// Requests admitted per window
    pub max_window: i64,
    /// Token bucket capacity
    pub bucket_size: i64,
    /// Interval at which one token is added back, e.g. `"6s"`
    pub refill_rate: String,
}

/// Validated limiter parameters.
///
/// Durations are held in whole seconds, which is the resolution the engine
/// and the request log work at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterConfig {
    window_secs: u64,
    max_window: u64,
    bucket_size: u64,
    refill_secs: u64,
}

impl LimiterConfig {
    /// Build a configuration from already-parsed values.
    pub fn new(
        window_size: Duration,
        max_window: u64,
        bucket_size: u64,
        refill_rate: Duration,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            window_secs: whole_seconds("window_size", window_size)?,
            max_window: positive("max_window", clamp_i64(max_window))?,
            bucket_size: positive("bucket_size", clamp_i64(bucket_size))?,
            refill_secs: whole_seconds("refill_rate", refill_rate)?,
        })
    }

    /// Validate a raw payload.
    pub fn from_document(doc: &LimiterDocument) -> Result<Self, ConfigError> {
        Ok(Self {
            window_secs: whole_seconds(
                "window_size",
                parse_field("window_size", &doc.window_size)?,
            )?,
            max_window: positive("max_window", doc.max_window)?,
            bucket_size: positive("bucket_size", doc.bucket_size)?,
            refill_secs: whole_seconds(
                "refill_rate",
                parse_field("refill_rate", &doc.refill_rate)?,
            )?,
        })
    }

    /// Parse and validate a JSON payload.
    pub fn from_json(payload: &[u8]) -> Result<Self, ConfigError> {
        let doc: LimiterDocument =
            serde_json::from_slice(payload).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        Self::from_document(&doc)
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    pub fn max_window(&self) -> u64 {
        self.max_window
    }

    pub fn bucket_size(&self) -> u64 {
        self.bucket_size
    }

    pub fn refill_secs(&self) -> u64 {
        self.refill_secs
    }

    /// How long token state must survive an idle key.
    ///
    /// After `bucket_size * refill_rate` of inactivity the bucket would be full
    /// again, so letting the state expire then yields the same decisions.
    pub fn state_ttl_secs(&self) -> u64 {
        self.window_secs
            .max(self.bucket_size.saturating_mul(self.refill_secs))
            .min(MAX_DURATION_SECS)
    }

    /// Convert back into the payload representation.
    pub fn to_document(&self) -> LimiterDocument {
        LimiterDocument {
            window_size: format!("{}s", self.window_secs),
            max_window: clamp_i64(self.max_window),
            bucket_size: clamp_i64(self.bucket_size),
            refill_rate: format!("{}s", self.refill_secs),
        }
    }
}

impl fmt::Display for LimiterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "window={}s max_window={} bucket={} refill={}s",
            self.window_secs, self.max_window, self.bucket_size, self.refill_secs
        )
    }
}

fn parse_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).map_err(|reason| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
        reason,
    })
}

fn whole_seconds(field: &'static str, value: Duration) -> Result<u64, ConfigError> {
    match value.as_secs() {
        0 => Err(ConfigError::TooShort {
            field,
            value: format!("{:?}", value),
        }),
        secs if secs > MAX_DURATION_SECS => Err(ConfigError::TooLong { field, value: secs }),
        secs => Ok(secs),
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn positive(field: &'static str, value: i64) -> Result<u64, ConfigError> {
    if value > 0 {
        Ok(value as u64)
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}
