//! BucketMQ - Session and delivery engine
//!
//! Usage:
//!   bucketmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>     Configuration file path
//!   -b, --buckets <N>       Number of bucket threads (default: CPU count)
//!   -d, --data-dir <DIR>    Persistence directory
//!   --in-memory             Keep all state in memory
//!   -l, --log-level         Log level (error, warn, info, debug, trace)
//!   -h, --help              Print help
//!
//! Without a transport attached the engine only restores state, runs the
//! expiry sweep and fires due wills; outgoing packets are logged.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use bucketmq::config::Config;
use bucketmq::delivery::ConnectionSink;
use bucketmq::hooks::DefaultHooks;
use bucketmq::persistence::{FjallStore, KvStore};
use bucketmq::protocol::OutboundPublish;
use bucketmq::Broker;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// BucketMQ - Session and delivery engine for MQTT brokers
#[derive(Parser, Debug)]
#[command(name = "bucketmq")]
#[command(author = "BucketMQ Contributors")]
#[command(version)]
#[command(about = "Session and delivery engine for MQTT v3.1.1/v5.0 brokers")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of bucket threads (0 = auto)
    #[arg(short, long)]
    buckets: Option<usize>,

    /// Persistence directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Disable persistence
    #[arg(long)]
    in_memory: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

/// Stands in for the transport: records outgoing packets in the log
struct LogSink;

impl ConnectionSink for LogSink {
    fn deliver(&self, client_id: &str, publish: OutboundPublish) {
        debug!(
            "PUBLISH to {}: topic={} qos={:?} packet_id={:?} dup={} ({} bytes)",
            client_id,
            publish.topic,
            publish.qos,
            publish.packet_id,
            publish.dup,
            publish.payload.len()
        );
    }

    fn release(&self, client_id: &str, packet_id: u16) {
        debug!("PUBREL to {}: packet_id={}", client_id, packet_id);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut file_config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::from_env()?,
    };

    // CLI overrides config, RUST_LOG overrides both
    let level = args
        .log_level
        .map(|l| l.as_str().to_string())
        .unwrap_or_else(|| file_config.log.level.to_lowercase());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .init();

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    if let Some(buckets) = args.buckets {
        file_config.executor.buckets = buckets;
    }
    if let Some(dir) = args.data_dir {
        file_config.persistence.path = dir;
    }
    if args.in_memory {
        file_config.persistence.enabled = false;
    }
    file_config.validate()?;

    let broker_config = file_config.broker_config();
    info!("Starting BucketMQ");
    info!("  Buckets: {}", broker_config.buckets);
    info!("  Max QoS: {:?}", broker_config.max_qos);
    info!(
        "  Queue limit: {} ({:?})",
        broker_config.session_limits.max_queued_messages,
        broker_config.session_limits.overflow_policy
    );
    info!(
        "  In-flight window: {}, retry interval: {:?}",
        broker_config.delivery.max_inflight, broker_config.delivery.retry_interval
    );

    let store: Option<Arc<dyn KvStore>> = if file_config.persistence.enabled {
        let persistence = &file_config.persistence;
        info!(
            "  Persistence: {} (sync writes: {})",
            persistence.path.display(),
            persistence.sync_writes
        );
        Some(Arc::new(FjallStore::open_with(
            &persistence.path,
            persistence.sync_writes,
        )?))
    } else {
        info!("  Persistence: disabled");
        None
    };

    let broker = Broker::start(broker_config, store, Arc::new(LogSink), Arc::new(DefaultHooks)).await?;
    info!(
        "Ready: {} sessions, {} retained messages",
        broker.session_count().await?,
        broker.retained_count().await?
    );

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    broker.shutdown();

    Ok(())
}
