//! Admission decisions and the header values derived from them.

use serde::Serialize;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_WINDOW: &str = "X-RateLimit-Window";
pub const HEADER_BUCKET: &str = "X-RateLimit-Bucket";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Which stage turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialStage {
    /// The sliding window already holds `max_window` requests
    Window,
    /// The token bucket is empty
    Bucket,
}

/// The outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests admitted per window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// Epoch seconds at which the window is considered reset
    pub reset_at: i64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Token bucket capacity
    pub bucket_size: u64,
    /// Seconds to wait before retrying, present only on denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Stage responsible for a denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied_by: Option<DenialStage>,
}

impl Decision {
    /// Header name/value pairs for the boundary layer.
    ///
    /// `Retry-After` is only present when the request was denied.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset_at.to_string()),
            (HEADER_WINDOW, self.window_secs.to_string()),
            (HEADER_BUCKET, self.bucket_size.to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            headers.push((HEADER_RETRY_AFTER, retry_after.to_string()));
        }
        headers
    }
}
