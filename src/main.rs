use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use redis::aio::MultiplexedConnection;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sluice::config::{LogFormat, LoggingSettings, ServiceConfig, SourceKind, StoreBackend};
use sluice::ratelimit::{LimiterFactory, LimiterRegistry, SystemClock};
use sluice::reload::{bootstrap, ConfigSource, ConfigWatcher, FileSource, RedisSource};
use sluice::store::{CounterStore, MemoryStore, RedisStore};
use sluice::Admission;

/// How often the process-local store drops expired keys.
const MEMORY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "sluice", version, about = "Distributed admission control")]
struct Cli {
    /// Path to a YAML settings file
    #[arg(short, long, env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the limiter and follow configuration changes until shutdown
    Serve,
    /// Run admission checks for a key and print each decision
    Check {
        key: String,

        /// Number of consecutive checks
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ServiceConfig::load(cli.config.as_deref()).context("failed to load settings")?;
    config.validate()?;
    init_tracing(&config.logging);

    info!("Starting Sluice admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let (store, redis_conn) = build_store(&config).await?;
    store.ping().await.context("counter store is unreachable")?;

    let factory = LimiterFactory::new(store, Arc::new(SystemClock))
        .with_key_prefix(config.store.key_prefix.clone());
    let registry = Arc::new(LimiterRegistry::new());
    let source = build_source(&config, redis_conn).await?;
    let updates = source.watch();

    let initial = bootstrap(source.as_ref(), &registry, &factory)
        .await
        .context("failed to load the initial limiter configuration")?;
    info!(limiter = %initial, "Limiter initialized");

    let admission = Admission::new(registry.clone(), config.admission.deadline());

    match cli.command {
        Command::Serve => {
            let watcher = ConfigWatcher::new(source, registry, factory).spawn(updates);

            shutdown_signal().await;
            watcher.abort();
        }
        Command::Check { key, count } => {
            for _ in 0..count {
                match admission.check(&key).await {
                    Ok(decision) => {
                        let headers: serde_json::Map<String, serde_json::Value> = decision
                            .headers()
                            .into_iter()
                            .map(|(name, value)| (name.to_string(), value.into()))
                            .collect();
                        let output = serde_json::json!({
                            "decision": decision,
                            "headers": headers,
                        });
                        println!("{}", serde_json::to_string(&output)?);
                    }
                    Err(e) => {
                        error!(key = %key, error = %e, "Admission check failed");
                        return Err(e.into());
                    }
                }
            }
        }
    }

    info!("Sluice stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Open the counter store, handing back the Redis connection when one exists
/// so the configuration source can share it.
async fn build_store(
    config: &ServiceConfig,
) -> anyhow::Result<(Arc<dyn CounterStore>, Option<MultiplexedConnection>)> {
    match config.store.backend {
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.store.redis)
                .await
                .context("failed to connect to the Redis counter store")?;
            let conn = store.connection();
            Ok((Arc::new(store) as Arc<dyn CounterStore>, Some(conn)))
        }
        StoreBackend::Memory => {
            info!("Using process-local counter store");
            let store = Arc::new(MemoryStore::new(Arc::new(SystemClock)));
            MemoryStore::spawn_sweeper(&store, MEMORY_SWEEP_INTERVAL);
            Ok((store as Arc<dyn CounterStore>, None))
        }
    }
}

async fn build_source(
    config: &ServiceConfig,
    redis_conn: Option<MultiplexedConnection>,
) -> anyhow::Result<Arc<dyn ConfigSource>> {
    let settings = &config.source;
    match settings.kind {
        SourceKind::File => {
            let path = settings
                .path
                .as_deref()
                .context("source.path is required for the file source")?;
            Ok(Arc::new(FileSource::new(path, settings.poll_interval())))
        }
        SourceKind::Redis => {
            let conn = match redis_conn {
                Some(conn) => conn,
                None => RedisStore::connect(&config.store.redis)
                    .await
                    .context("failed to connect to the Redis configuration source")?
                    .connection(),
            };
            let timeout = Duration::from_millis(config.store.redis.operation_timeout_ms);
            Ok(Arc::new(RedisSource::new(
                conn,
                settings.key.clone(),
                settings.poll_interval(),
                timeout,
            )))
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
