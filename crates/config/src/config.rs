//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
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

/// Network and storage location of the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address the RPC listener binds to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// RPC port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory holding the queue snapshot, logs, profiles and service settings
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Address of the read-only status endpoint (empty disables it)
    #[serde(default = "default_status_bind")]
    pub status_bind: String,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    32768
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_status_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            data_dir: default_data_dir(),
            status_bind: default_status_bind(),
        }
    }
}

/// Local-time window during which all workers are suspended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuietHours {
    /// First suspended hour (0-23)
    pub start_hour: u32,
    /// First hour after the window (0-23); may wrap past midnight
    pub end_hour: u32,
}

impl QuietHours {
    /// Whether the given local hour falls inside the window
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour == self.end_hour {
            return false;
        }
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Worker pool and GPU budget configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Number of worker slots (0 = derive from CPU count)
    #[serde(default)]
    pub parallelism: u32,
    /// Number of GPU resource lines
    #[serde(default = "default_num_gpu")]
    pub num_gpu: u32,
    /// Per-line percentage budget; missing entries default to 100
    #[serde(default)]
    pub max_gpu_percent: Vec<u32>,
    /// Start with admission paused when the restored queue has active jobs
    #[serde(default)]
    pub pause_on_started: bool,
    /// Optional quiet-hours window
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
}

fn default_num_gpu() -> u32 {
    1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallelism: 0,
            num_gpu: default_num_gpu(),
            max_gpu_percent: Vec::new(),
            pause_on_started: false,
            quiet_hours: None,
        }
    }
}

impl SchedulerConfig {
    /// Percentage budget of every configured line
    pub fn gpu_budgets(&self) -> Vec<u32> {
        (0..self.num_gpu as usize)
            .map(|i| self.max_gpu_percent.get(i).copied().unwrap_or(100))
            .collect()
    }
}

/// External program configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Encoder executable
    #[serde(default = "default_executable")]
    pub executable: PathBuf,
    /// Stream prober executable
    #[serde(default = "default_prober")]
    pub prober: PathBuf,
    /// Directory holding add-hook scripts
    #[serde(default = "default_hook_dir")]
    pub hook_dir: PathBuf,
    /// Scratch directory for local copies of hashed sources
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Incident count at which a zero exit is still treated as failure
    #[serde(default = "default_incident_threshold")]
    pub incident_threshold: u32,
    /// Exit code the encoder uses for "no matching logo found"
    #[serde(default = "default_logo_not_found_exit_code")]
    pub logo_not_found_exit_code: i32,
    /// Let jobs without a logo run anyway (the encoder reports the problem)
    #[serde(default)]
    pub logo_pending_as_error: bool,
}

fn default_executable() -> PathBuf {
    PathBuf::from("encoder")
}

fn default_prober() -> PathBuf {
    PathBuf::from("tsprobe")
}

fn default_hook_dir() -> PathBuf {
    PathBuf::from("./hooks")
}

fn default_work_dir() -> PathBuf {
    env::temp_dir().join("encode-queue")
}

fn default_incident_threshold() -> u32 {
    10
}

fn default_logo_not_found_exit_code() -> i32 {
    100
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            prober: default_prober(),
            hook_dir: default_hook_dir(),
            work_dir: default_work_dir(),
            incident_threshold: default_incident_threshold(),
            logo_not_found_exit_code: default_logo_not_found_exit_code(),
            logo_pending_as_error: false,
        }
    }
}

/// Background loop intervals
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistenceConfig {
    /// Seconds between dirty-state flushes
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,
    /// Seconds between logo/profile directory polls
    #[serde(default = "default_watch_interval_secs")]
    pub watch_interval_secs: u64,
}

fn default_save_interval_secs() -> u64 {
    5
}

fn default_watch_interval_secs() -> u64 {
    10
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            save_interval_secs: default_save_interval_secs(),
            watch_interval_secs: default_watch_interval_secs(),
        }
    }
}

/// Log retention
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogsConfig {
    /// Delete log records older than `delete_old_logs_days`
    #[serde(default = "default_delete_old_logs")]
    pub delete_old_logs: bool,
    /// Retention in days
    #[serde(default = "default_delete_old_logs_days")]
    pub delete_old_logs_days: u32,
}

fn default_delete_old_logs() -> bool {
    true
}

fn default_delete_old_logs_days() -> u32 {
    180
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            delete_old_logs: default_delete_old_logs(),
            delete_old_logs_days: default_delete_old_logs_days(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logs: LogsConfig,
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - ENCODE_QUEUE_PORT -> server.port
    /// - ENCODE_QUEUE_DATA_DIR -> server.data_dir
    /// - ENCODE_QUEUE_PARALLELISM -> scheduler.parallelism
    /// - ENCODE_QUEUE_NUM_GPU -> scheduler.num_gpu
    /// - ENCODE_QUEUE_ENCODER -> encoder.executable
    /// - ENCODE_QUEUE_PROBER -> encoder.prober
    /// - ENCODE_QUEUE_LOGO_PENDING_AS_ERROR -> encoder.logo_pending_as_error
    /// - ENCODE_QUEUE_DELETE_OLD_LOGS_DAYS -> logs.delete_old_logs_days
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("ENCODE_QUEUE_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(val) = env::var("ENCODE_QUEUE_DATA_DIR") {
            if !val.is_empty() {
                self.server.data_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("ENCODE_QUEUE_PARALLELISM") {
            if let Ok(n) = val.parse::<u32>() {
                self.scheduler.parallelism = n;
            }
        }

        if let Ok(val) = env::var("ENCODE_QUEUE_NUM_GPU") {
            if let Ok(n) = val.parse::<u32>() {
                self.scheduler.num_gpu = n;
            }
        }

        if let Ok(val) = env::var("ENCODE_QUEUE_ENCODER") {
            if !val.is_empty() {
                self.encoder.executable = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("ENCODE_QUEUE_PROBER") {
            if !val.is_empty() {
                self.encoder.prober = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("ENCODE_QUEUE_LOGO_PENDING_AS_ERROR") {
            // Invalid value keeps the existing setting
            if let Some(flag) = parse_bool(&val) {
                self.encoder.logo_pending_as_error = flag;
            }
        }

        if let Ok(val) = env::var("ENCODE_QUEUE_DELETE_OLD_LOGS_DAYS") {
            if let Ok(days) = val.parse::<u32>() {
                self.logs.delete_old_logs_days = days;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Built-in defaults with environment overrides, used when no file is given
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }
}
