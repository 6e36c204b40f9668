//! Configuration sources and the watcher that swaps the active limiter when
//! the configuration changes.

mod source;
mod watcher;

pub use source::{ChannelSource, ConfigSource, FileSource, PayloadStream, RedisSource, SourceError};
pub use watcher::{bootstrap, ConfigWatcher};
