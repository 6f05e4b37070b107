//! Configuration loading from `skirmish-config.yaml`.
//!
//! Every section and field has a serde default, so a missing or partial
//! file still yields a complete [`SkirmishConfig`]. A handful of deployment
//! settings can be overridden from the environment (see
//! [`SkirmishConfig::apply_env_overrides`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use skirmish_store::WindowConfig;

use crate::time::TimestampFallback;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse the YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value parsed but cannot be used.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct SkirmishConfig {
    /// Message transport settings.
    #[serde(default)]
    pub transport: TransportConfig,

    /// State store settings.
    #[serde(default)]
    pub stores: StoreConfig,

    /// Round intake settings.
    #[serde(default)]
    pub intake: IntakeConfig,

    /// Player correlator settings.
    #[serde(default)]
    pub correlator: CorrelatorConfig,

    /// Partitioning and batching.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Query API server.
    #[serde(default)]
    pub query: QueryConfig,

    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SkirmishConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or
    /// contains an unusable value.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    /// Environment overrides apply either way.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::from_file(path);
        }
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the YAML is malformed and
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml).map_err(|source| ConfigError::Yaml { source })?
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Override deployment settings with environment variables when set.
    ///
    /// `NATS_URL`, `SKIRMISH_STATE_DIR`, and `SKIRMISH_QUERY_PORT` let a
    /// container deployment relocate the pipeline without editing YAML.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("NATS_URL") {
            self.transport.nats_url = val;
        }
        if let Ok(val) = std::env::var("SKIRMISH_STATE_DIR") {
            self.stores.state_dir = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("SKIRMISH_QUERY_PORT") {
            self.query.port = val.parse().map_err(|e| ConfigError::Invalid {
                field: "query.port",
                reason: format!("SKIRMISH_QUERY_PORT={val}: {e}"),
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.partitions == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.partitions",
                reason: "must be at least 1".to_owned(),
            });
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.channel_capacity",
                reason: "must be at least 1".to_owned(),
            });
        }
        if self.stores.bucket_size_ms == 0 || self.stores.bucket_count == 0 {
            return Err(ConfigError::Invalid {
                field: "stores",
                reason: "bucket_size_ms and bucket_count must be positive".to_owned(),
            });
        }
        if self.intake.timestamp_fallback == TimestampFallback::Sentinel
            && self.intake.sentinel_time().is_none()
        {
            return Err(ConfigError::Invalid {
                field: "intake.sentinel_time_ms",
                reason: format!("{} is not a representable time", self.intake.sentinel_time_ms),
            });
        }
        Ok(())
    }
}

/// NATS transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransportConfig {
    /// NATS server URL.
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Subject carrying arena upserts and tombstones.
    #[serde(default = "default_arena_subject")]
    pub arena_subject: String,

    /// Subject carrying round events.
    #[serde(default = "default_round_subject")]
    pub round_subject: String,

    /// Subject victory decisions are published to.
    #[serde(default = "default_result_subject")]
    pub result_subject: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            nats_url: default_nats_url(),
            arena_subject: default_arena_subject(),
            round_subject: default_round_subject(),
            result_subject: default_result_subject(),
        }
    }
}

/// State store settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreConfig {
    /// Directory holding store state. `None` keeps everything in memory.
    #[serde(default = "default_state_dir")]
    pub state_dir: Option<PathBuf>,

    /// Width of one victory window bucket in milliseconds.
    #[serde(default = "default_bucket_size_ms")]
    pub bucket_size_ms: u64,

    /// Number of victory window buckets retained.
    #[serde(default = "default_bucket_count")]
    pub bucket_count: u32,

    /// Keep every value per key within a bucket.
    #[serde(default)]
    pub retain_duplicates: bool,

    /// Remove `state_dir` after a graceful shutdown.
    #[serde(default)]
    pub cleanup_on_shutdown: bool,
}

impl StoreConfig {
    /// Window parameters for the victory store.
    pub const fn window(&self) -> WindowConfig {
        WindowConfig {
            bucket_size: Duration::from_millis(self.bucket_size_ms),
            bucket_count: self.bucket_count,
            retain_duplicates: self.retain_duplicates,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            bucket_size_ms: default_bucket_size_ms(),
            bucket_count: default_bucket_count(),
            retain_duplicates: false,
            cleanup_on_shutdown: false,
        }
    }
}

/// Round intake settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct IntakeConfig {
    /// What to do when a round carries no usable event time.
    #[serde(default)]
    pub timestamp_fallback: TimestampFallback,

    /// Fixed event time (epoch ms) used by the `sentinel` fallback.
    #[serde(default)]
    pub sentinel_time_ms: i64,
}

impl IntakeConfig {
    /// The sentinel fallback time, if representable.
    pub fn sentinel_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.sentinel_time_ms)
    }
}

/// What the correlator does with an event whose arena is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedArenaPolicy {
    /// Forward the event without arena metadata, flagged as unresolved.
    #[default]
    ForwardFlagged,
    /// Drop the event and count it.
    Drop,
}

/// Player correlator settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct CorrelatorConfig {
    /// Policy for events referencing an unknown arena.
    #[serde(default)]
    pub unresolved_arena: UnresolvedArenaPolicy,
}

/// Partitioning, batching, and fault tolerance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PipelineConfig {
    /// Number of round partitions, each processed by its own task.
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Capacity of every bounded channel between stages.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Maximum records processed between two commits.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Times a task may be rebuilt after a storage fault before the
    /// partition is given up.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            channel_capacity: default_channel_capacity(),
            batch_size: default_batch_size(),
            max_restarts: default_max_restarts(),
        }
    }
}

/// Query API server settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueryConfig {
    /// Interface to bind.
    #[serde(default = "default_query_host")]
    pub host: String,

    /// Port to bind.
    #[serde(default = "default_query_port")]
    pub port: u16,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            host: default_query_host(),
            port: default_query_port(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions (serde default requires named functions)
// ---------------------------------------------------------------------------

fn default_nats_url() -> String {
    "nats://localhost:4222".to_owned()
}

fn default_arena_subject() -> String {
    "skirmish.arenas".to_owned()
}

fn default_round_subject() -> String {
    "skirmish.rounds".to_owned()
}

fn default_result_subject() -> String {
    "skirmish.results".to_owned()
}

fn default_state_dir() -> Option<PathBuf> {
    Some(PathBuf::from("skirmish-state"))
}

const fn default_bucket_size_ms() -> u64 {
    15_000
}

const fn default_bucket_count() -> u32 {
    2
}

const fn default_partitions() -> u32 {
    4
}

const fn default_channel_capacity() -> usize {
    1024
}

const fn default_batch_size() -> usize {
    100
}

const fn default_max_restarts() -> u32 {
    3
}

fn default_query_host() -> String {
    "0.0.0.0".to_owned()
}

const fn default_query_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_owned()
}
