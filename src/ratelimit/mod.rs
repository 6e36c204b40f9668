//! Rate limiting logic: configuration, the decision engine and the registry
//! holding the active engine.

mod clock;
mod decision;
mod duration;
mod keys;
mod limiter;
mod limits;
mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{Decision, DenialStage};
pub use decision::{
    HEADER_BUCKET, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER,
    HEADER_WINDOW,
};
pub use duration::parse_duration;
pub use keys::KeySpace;
pub use limiter::{HybridLimiter, LimiterFactory};
pub use limits::{ConfigError, LimiterConfig, LimiterDocument, MAX_DURATION_SECS};
pub use registry::LimiterRegistry;
