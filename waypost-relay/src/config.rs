//! Configuration loading for waypost-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`).
//! Every section and key is optional.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use waypost_core::DEFAULT_DIFFICULTY;
use waypost_types::{Address, DIFFICULTY_LEN};

/// Root configuration for waypost-relay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Offline buffer and pending-connection timing.
    pub scheduler: SchedulerConfig,
    /// Default allow/deny lists.
    pub permissions: PermissionsConfig,
    /// Handshake configuration.
    pub auth: AuthConfig,
    /// Rate limiting configuration.
    pub limits: LimitsConfig,
    /// Worker pool sizing.
    pub workers: WorkersConfig,
    /// Cleanup task configuration.
    pub cleanup: CleanupConfig,
    /// HTTP endpoints configuration.
    pub http: HttpConfig,
    /// Overlay behaviour.
    pub overlay: OverlayConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for WebSocket and HTTP (default: 0.0.0.0:9001).
    pub bind_address: String,
    /// Log filter used when `RUST_LOG` is unset (default: info).
    pub log_filter: String,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Pending-handshake timeout and unsubscribe grace, in ms (default: 30000).
    pub interval_ms: u64,
    /// Buffered messages per recipient (default: 20).
    pub size: usize,
    /// Buffer TTL and minimum sweep spacing, in ms (default: 60000).
    pub timeframe_ms: u64,
}

/// Global permission lists, used for senders that supplied none.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Hex addresses allowed to use the relay (empty: everyone).
    pub allow_list: Vec<Address>,
    /// Hex addresses always rejected.
    pub deny_list: Vec<Address>,
}

/// Handshake configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Proof-of-work mask as 32 hex chars (default: all `ff`).
    pub difficulty: String,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Messages per connection per window (default: 100).
    pub limit: u32,
    /// Window length and pause duration, in ms (default: 1000).
    pub interval_ms: u64,
    /// Aggregate frames per second across all connections (default: 10000).
    pub global_messages_per_second: u32,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Processor units (default: 1).
    pub processors: usize,
    /// Overlay units (default: 1). Commands about one address always share
    /// a unit.
    pub overlays: usize,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Enable cleanup task (default: true).
    pub enabled: bool,
    /// Cleanup interval in seconds (default: 3600 = 1 hour).
    pub interval_secs: u64,
    /// Evict registered connections idle for longer than this (default: 900).
    pub idle_timeout_secs: u64,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Enable metrics endpoint (default: true).
    pub metrics_enabled: bool,
}

/// Overlay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Announce local deliveries so other instances drop their copies
    /// (default: true).
    pub delivery_notices: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:9001".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_scheduler_interval_ms() -> u64 {
    30_000
}

fn default_scheduler_size() -> usize {
    waypost_core::DEFAULT_LIMIT_SIZE
}

fn default_scheduler_timeframe_ms() -> u64 {
    waypost_core::DEFAULT_TIMEFRAME_MS
}

fn default_difficulty() -> String {
    hex::encode(DEFAULT_DIFFICULTY)
}

fn default_limit() -> u32 {
    100
}

fn default_limit_interval_ms() -> u64 {
    1_000
}

fn default_global_messages_per_second() -> u32 {
    10_000
}

fn default_cleanup_interval() -> u64 {
    3600 // 1 hour
}

fn default_idle_timeout_secs() -> u64 {
    900 // 15 minutes
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            log_filter: default_log_filter(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_scheduler_interval_ms(),
            size: default_scheduler_size(),
            timeframe_ms: default_scheduler_timeframe_ms(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            difficulty: default_difficulty(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            interval_ms: default_limit_interval_ms(),
            global_messages_per_second: default_global_messages_per_second(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            processors: 1,
            overlays: 1,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_cleanup_interval(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            delivery_notices: true,
        }
    }
}

impl SchedulerConfig {
    /// Pending-handshake timeout.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl LimitsConfig {
    /// Rate limit window length.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl AuthConfig {
    /// Decode the configured difficulty mask.
    pub fn difficulty_mask(&self) -> Result<[u8; DIFFICULTY_LEN], ConfigError> {
        let bytes = hex::decode(&self.difficulty).map_err(|e| ConfigError::Invalid {
            field: "auth.difficulty",
            reason: e.to_string(),
        })?;
        bytes.try_into().map_err(|b: Vec<u8>| ConfigError::Invalid {
            field: "auth.difficulty",
            reason: format!("expected {} bytes, got {}", DIFFICULTY_LEN, b.len()),
        })
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        nonzero("scheduler.interval_ms", self.scheduler.interval_ms)?;
        nonzero("scheduler.size", self.scheduler.size as u64)?;
        nonzero("scheduler.timeframe_ms", self.scheduler.timeframe_ms)?;
        nonzero("limits.limit", self.limits.limit as u64)?;
        nonzero("limits.interval_ms", self.limits.interval_ms)?;
        nonzero(
            "limits.global_messages_per_second",
            self.limits.global_messages_per_second as u64,
        )?;
        nonzero("workers.processors", self.workers.processors as u64)?;
        nonzero("workers.overlays", self.workers.overlays as u64)?;
        if self.cleanup.enabled {
            nonzero("cleanup.interval_secs", self.cleanup.interval_secs)?;
            nonzero("cleanup.idle_timeout_secs", self.cleanup.idle_timeout_secs)?;
        }
        self.auth.difficulty_mask()?;
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted key name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
