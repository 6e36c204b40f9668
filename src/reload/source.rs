//! Configuration sources: where limiter payloads come from and how changes
//! are noticed.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

/// Errors raised while reading a configuration source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("configuration source timed out after {0:?}")]
    Timeout(Duration),
}

/// A stream of raw configuration payloads, one per observed change.
pub type PayloadStream = BoxStream<'static, Result<Vec<u8>, SourceError>>;

/// Trait for external stores holding the limiter configuration.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Human-readable location, used in logs and errors.
    fn describe(&self) -> String;

    /// Read the current payload; `None` when the key does not exist.
    async fn fetch(&self) -> Result<Option<Vec<u8>>, SourceError>;

    /// Subscribe to changes. Each item is the new payload.
    fn watch(&self) -> PayloadStream;
}

/// A source fed in-process, for embedding and tests.
pub struct ChannelSource {
    sender: watch::Sender<Option<Vec<u8>>>,
}

impl ChannelSource {
    pub fn new(initial: Option<Vec<u8>>) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    /// Replace the stored payload and notify watchers.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) {
        self.sender.send_replace(Some(payload.into()));
    }
}

#[async_trait]
impl ConfigSource for ChannelSource {
    fn describe(&self) -> String {
        "in-process channel".to_string()
    }

    async fn fetch(&self) -> Result<Option<Vec<u8>>, SourceError> {
        Ok(self.sender.borrow().clone())
    }

    fn watch(&self) -> PayloadStream {
        WatchStream::from_changes(self.sender.subscribe())
            .filter_map(|payload| async move { payload.map(Ok::<_, SourceError>) })
            .boxed()
    }
}

/// A configuration file, re-read at a fixed interval.
pub struct FileSource {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }
}

async fn read_file(path: PathBuf) -> Result<Option<Vec<u8>>, SourceError> {
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(SourceError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

#[async_trait]
impl ConfigSource for FileSource {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    async fn fetch(&self) -> Result<Option<Vec<u8>>, SourceError> {
        read_file(self.path.clone()).await
    }

    fn watch(&self) -> PayloadStream {
        let path = self.path.clone();
        poll_changes(self.poll_interval, move || read_file(path.clone()))
    }
}

/// A well-known Redis key holding the payload, polled for changes.
pub struct RedisSource {
    conn: MultiplexedConnection,
    key: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl RedisSource {
    pub fn new(
        conn: MultiplexedConnection,
        key: impl Into<String>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            conn,
            key: key.into(),
            poll_interval,
            timeout,
        }
    }
}

async fn read_key(
    mut conn: MultiplexedConnection,
    key: String,
    timeout: Duration,
) -> Result<Option<Vec<u8>>, SourceError> {
    match tokio::time::timeout(timeout, conn.get::<_, Option<Vec<u8>>>(&key)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(SourceError::Timeout(timeout)),
    }
}

#[async_trait]
impl ConfigSource for RedisSource {
    fn describe(&self) -> String {
        format!("redis key {}", self.key)
    }

    async fn fetch(&self) -> Result<Option<Vec<u8>>, SourceError> {
        read_key(self.conn.clone(), self.key.clone(), self.timeout).await
    }

    fn watch(&self) -> PayloadStream {
        let conn = self.conn.clone();
        let key = self.key.clone();
        let timeout = self.timeout;
        poll_changes(self.poll_interval, move || {
            read_key(conn.clone(), key.clone(), timeout)
        })
    }
}

struct PollState<F> {
    ticker: Option<Interval>,
    period: Duration,
    last: Option<Vec<u8>>,
    read: F,
}

/// Turn a point read into a change stream by polling it every `period`.
///
/// Emits a payload whenever it differs from the last one emitted. A missing
/// value is not a change: the previous configuration simply stays in force.
fn poll_changes<F, Fut>(period: Duration, read: F) -> PayloadStream
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<Vec<u8>>, SourceError>> + Send + 'static,
{
    let state = PollState {
        ticker: None,
        period,
        last: None,
        read,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            let ticker = state.ticker.get_or_insert_with(|| {
                let mut ticker = tokio::time::interval(state.period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });
            ticker.tick().await;

            match (state.read)().await {
                Ok(Some(payload)) if state.last.as_deref() != Some(payload.as_slice()) => {
                    state.last = Some(payload.clone());
                    return Some((Ok(payload), state));
                }
                Ok(Some(_)) => {}
                Ok(None) => debug!("Configuration value absent, keeping previous"),
                Err(e) => return Some((Err(e), state)),
            }
        }
    })
    .boxed()
}
