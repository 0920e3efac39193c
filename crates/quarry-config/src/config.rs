//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Connection loop and framing settings.
    pub network: NetworkConfig,
    /// Compression defaults used before negotiation.
    pub compression: CompressionSettings,
    /// Game server the accounts connect to.
    pub game: GameConfig,
    /// Query scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Operator protocol settings.
    pub operator: OperatorConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Connection loop and framing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Seconds without a packet before a connection exits.
    pub idle_timeout_secs: u64,
    /// Milliseconds one read waits for a frame to start.
    pub poll_timeout_ms: u64,
    /// Seconds allowed for the rest of a frame once it started.
    pub body_timeout_secs: u64,
    /// Frames read per loop iteration.
    pub max_reads_per_tick: usize,
    /// Queued packets written per loop iteration.
    pub max_writes_per_tick: usize,
    /// Outbound queue capacity per connection.
    pub queue_capacity: usize,
    /// Largest accepted frame payload in bytes.
    pub max_payload_size: u32,
}

/// Compression configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompressionSettings {
    /// Compress payloads above the threshold.
    pub enabled: bool,
    /// Payloads longer than this many bytes are compressed.
    pub threshold: usize,
}

/// Game server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GameConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
}

/// Query scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Milliseconds between scheduler cycles.
    pub tick_interval_ms: u64,
    /// Queries one account may have in flight at once.
    pub account_capacity: usize,
    /// Milliseconds before an unanswered dig is reported unloaded.
    pub digging_timeout_ms: u64,
    /// Digging queries per second per dimension, for utilisation reporting.
    pub digging_max_throughput: f32,
    /// Samples kept by each rate window.
    pub rate_samples: usize,
    /// Milliseconds per processed-rate sample.
    pub processed_sample_ms: u64,
    /// Milliseconds per rescheduled-rate sample.
    pub rescheduled_sample_ms: u64,
    /// Milliseconds between metrics pushed to operators.
    pub info_interval_ms: u64,
}

/// Role this instance announces to the operator server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperatorRole {
    Listening,
    Reporting,
    Archiving,
}

impl OperatorRole {
    /// Lower-case names, in declaration order.
    pub const NAMES: &'static [&'static str] = &["listening", "reporting", "archiving"];

    /// Lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            OperatorRole::Listening => "listening",
            OperatorRole::Reporting => "reporting",
            OperatorRole::Archiving => "archiving",
        }
    }

    /// Parse a name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "listening" => Some(OperatorRole::Listening),
            "reporting" => Some(OperatorRole::Reporting),
            "archiving" => Some(OperatorRole::Archiving),
            _ => None,
        }
    }
}

/// Operator protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OperatorConfig {
    /// Connect out to an operator server.
    pub enabled: bool,
    /// Operator server host.
    pub host: String,
    /// Operator server port.
    pub port: u16,
    /// Role announced in the init request.
    pub role: OperatorRole,
    /// Name announced in the init request.
    pub handler_name: String,
    /// DER-encoded PKCS#8 private key proving this instance's identity.
    pub identity_key: Option<PathBuf>,
    /// Address an operator server listens on.
    pub listen_addr: String,
    /// DER-encoded public keys of trusted reporting/archiving clients.
    pub trusted_keys: Vec<PathBuf>,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Also write JSON logs to a file.
    pub file_logging: bool,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30,
            poll_timeout_ms: 5,
            body_timeout_secs: 10,
            max_reads_per_tick: 10,
            max_writes_per_tick: 15,
            queue_capacity: 4096,
            max_payload_size: 2 * 1024 * 1024,
        }
    }
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 256,
        }
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 25565,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 50,
            account_capacity: 4,
            digging_timeout_ms: 2000,
            digging_max_throughput: 20.0,
            rate_samples: 10,
            processed_sample_ms: 250,
            rescheduled_sample_ms: 500,
            info_interval_ms: 1000,
        }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 5001,
            role: OperatorRole::Reporting,
            handler_name: "quarry".to_string(),
            identity_key: None,
            listen_addr: "127.0.0.1:5001".to_string(),
            trusted_keys: Vec::new(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            file_logging: false,
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Default config directory: `<platform config dir>/quarry`.
    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quarry")
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            tracing::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            tracing::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            tracing::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
