//! Configuration Module
//!
//! Provides TOML-based configuration for BucketMQ with support for:
//! - Executor sizing
//! - Session queue limits and expiry sweeping
//! - Delivery window and retransmission
//! - MQTT feature flags
//! - Persistence
//! - Environment variable overrides (BUCKETMQ__* prefix)

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::delivery::DeliveryConfig;
use crate::protocol::QoS;
use crate::session::{OverflowPolicy, SessionLimits, EXPIRY_NEVER};

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Bucket worker pool
    pub executor: ExecutorConfig,
    /// Session configuration
    pub session: SessionConfig,
    /// Outgoing delivery
    pub delivery: DeliveryLimits,
    /// MQTT feature configuration
    pub mqtt: MqttConfig,
    /// Durable storage
    pub persistence: PersistenceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Executor configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Number of bucket workers (0 = available parallelism)
    pub buckets: usize,
}

impl ExecutorConfig {
    /// Resolved worker count
    pub fn bucket_count(&self) -> usize {
        if self.buckets > 0 {
            return self.buckets;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum queued messages per session (0 = unbounded)
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
    /// Behaviour of a full queue holding no QoS 0 message
    pub overflow_policy: OverflowPolicy,
    /// How often each bucket sweeps for expired sessions (e.g. "60s")
    #[serde(default = "default_expiry_check_interval", with = "humantime_serde")]
    pub expiry_check_interval: Duration,
    /// Upper bound on client-requested session expiry, in seconds
    #[serde(default = "default_max_session_expiry")]
    pub max_session_expiry: u32,
}

fn default_max_queued_messages() -> usize {
    1000
}
fn default_expiry_check_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_max_session_expiry() -> u32 {
    EXPIRY_NEVER
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_queued_messages: default_max_queued_messages(),
            overflow_policy: OverflowPolicy::default(),
            expiry_check_interval: default_expiry_check_interval(),
            max_session_expiry: default_max_session_expiry(),
        }
    }
}

/// Delivery configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryLimits {
    /// Maximum in-flight messages per client (QoS 1/2, 0 = unbounded)
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// Retransmission interval for unacknowledged messages; "0s" disables
    /// timer-driven retransmission
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Maximum pending PUBREL for inbound QoS 2
    #[serde(default = "default_max_awaiting_rel")]
    pub max_awaiting_rel: usize,
}

fn default_max_inflight() -> usize {
    32
}
fn default_retry_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_max_awaiting_rel() -> usize {
    100
}

impl Default for DeliveryLimits {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
            retry_interval: default_retry_interval(),
            max_awaiting_rel: default_max_awaiting_rel(),
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level (0, 1, or 2)
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
    /// Whether retained messages are available
    #[serde(default = "default_true")]
    pub retain_available: bool,
    /// Maximum topic levels (0 = unlimited)
    #[serde(default)]
    pub max_topic_levels: usize,
}

fn default_max_qos() -> u8 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: default_max_qos(),
            retain_available: true,
            max_topic_levels: 0,
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Enable persistence; disabled keeps all state in memory
    pub enabled: bool,
    /// Data directory path (for fjall)
    pub path: PathBuf,
    /// Sync the journal before every write returns
    pub sync_writes: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("./data"),
            sync_writes: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `BUCKETMQ__` prefix with double underscores for nesting:
    ///    - `BUCKETMQ__EXECUTOR__BUCKETS=8` overrides `executor.buckets`
    ///    - `BUCKETMQ__SESSION__OVERFLOW_POLICY=drop_oldest` overrides `session.overflow_policy`
    ///    - `BUCKETMQ__PERSISTENCE__ENABLED=false` overrides `persistence.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("executor.buckets", 0)?
            .set_default("session.max_queued_messages", 1000)?
            .set_default("session.overflow_policy", "reject_new")?
            .set_default("session.expiry_check_interval", "60s")?
            .set_default("session.max_session_expiry", EXPIRY_NEVER as u64)?
            .set_default("delivery.max_inflight", 32)?
            .set_default("delivery.retry_interval", "30s")?
            .set_default("delivery.max_awaiting_rel", 100)?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.retain_available", true)?
            .set_default("mqtt.max_topic_levels", 0)?
            .set_default("persistence.enabled", true)?
            .set_default("persistence.path", "./data")?
            .set_default("persistence.sync_writes", true)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("BUCKETMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }

        if self.session.expiry_check_interval.is_zero() {
            return Err(ConfigError::Validation(
                "session.expiry_check_interval must be greater than zero".to_string(),
            ));
        }

        if self.persistence.enabled && self.persistence.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "persistence.path is required when persistence is enabled".to_string(),
            ));
        }

        // Note: 0 means unbounded for max_queued_messages, max_inflight and
        // max_awaiting_rel

        Ok(())
    }

    /// Queue and window limits for the session stores
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_queued_messages: self.session.max_queued_messages,
            overflow_policy: self.session.overflow_policy,
            max_awaiting_rel: self.delivery.max_awaiting_rel,
        }
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            max_inflight: self.delivery.max_inflight,
            retry_interval: self.delivery.retry_interval,
        }
    }

    /// Runtime settings for [`crate::Broker::start`]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            buckets: self.executor.bucket_count(),
            session_limits: self.session_limits(),
            delivery: self.delivery_config(),
            expiry_check_interval: self.session.expiry_check_interval,
            max_session_expiry: self.session.max_session_expiry,
            max_qos: QoS::from_u8(self.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            retain_available: self.mqtt.retain_available,
            max_topic_levels: self.mqtt.max_topic_levels,
        }
    }
}
