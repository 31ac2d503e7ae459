//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

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

/// HTTP status surface configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Listen address for the health endpoints
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Expose `/recovery/status` and `/recovery/trigger` (default false)
    #[serde(default)]
    pub recovery_endpoints: bool,
}

fn default_listen() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            recovery_endpoints: false,
        }
    }
}

/// Health sampling and check configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    /// Seconds between composite health checks
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Seconds between metric samples
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    /// Resident memory (MB) above which the memory check warns
    #[serde(default = "default_memory_warning_mb")]
    pub memory_warning_mb: u64,
    /// Resident memory (MB) above which the memory check fails
    #[serde(default = "default_memory_critical_mb")]
    pub memory_critical_mb: u64,
    /// Seconds after a stream (re)start during which stream and encoder checks are lenient
    #[serde(default = "default_stream_grace_secs")]
    pub stream_grace_secs: u64,
    /// Error count at or above which the agent is no longer healthy
    #[serde(default = "default_error_ceiling")]
    pub error_ceiling: u64,
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_metrics_interval_secs() -> u64 {
    10
}

fn default_memory_warning_mb() -> u64 {
    1536
}

fn default_memory_critical_mb() -> u64 {
    2560
}

fn default_stream_grace_secs() -> u64 {
    60
}

fn default_error_ceiling() -> u64 {
    50
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            metrics_interval_secs: default_metrics_interval_secs(),
            memory_warning_mb: default_memory_warning_mb(),
            memory_critical_mb: default_memory_critical_mb(),
            stream_grace_secs: default_stream_grace_secs(),
            error_ceiling: default_error_ceiling(),
        }
    }
}

/// Encoder telemetry monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringConfig {
    /// Attach the quality monitor to every encoder session
    #[serde(default = "default_true")]
    pub stream_monitoring: bool,
    /// Seconds between quality analysis ticks
    #[serde(default = "default_analysis_interval_secs")]
    pub analysis_interval_secs: u64,
    /// Seconds without telemetry after which a session is treated as ended
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
    /// Length of the startup phase in seconds
    #[serde(default = "default_startup_window_secs")]
    pub startup_window_secs: u64,
    /// Number of quality snapshots kept for status reporting
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_analysis_interval_secs() -> u64 {
    5
}

fn default_stale_timeout_secs() -> u64 {
    30
}

fn default_startup_window_secs() -> u64 {
    60
}

fn default_history_size() -> usize {
    60
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            stream_monitoring: true,
            analysis_interval_secs: default_analysis_interval_secs(),
            stale_timeout_secs: default_stale_timeout_secs(),
            startup_window_secs: default_startup_window_secs(),
            history_size: default_history_size(),
        }
    }
}

/// Per-action enable flags for automatic recovery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryActionsConfig {
    #[serde(default = "default_true")]
    pub reconnect_connection: bool,
    #[serde(default = "default_true")]
    pub reconnect_voice: bool,
    #[serde(default = "default_true")]
    pub restart_stream: bool,
    #[serde(default = "default_true")]
    pub memory_cleanup: bool,
    #[serde(default = "default_true")]
    pub restart_encoder: bool,
    #[serde(default = "default_true")]
    pub network_reset: bool,
}

impl Default for RecoveryActionsConfig {
    fn default() -> Self {
        Self {
            reconnect_connection: true,
            reconnect_voice: true,
            restart_stream: true,
            memory_cleanup: true,
            restart_encoder: true,
            network_reset: true,
        }
    }
}

impl RecoveryActionsConfig {
    /// Look up the enable flag for an action by its catalog name.
    ///
    /// Unknown names are treated as disabled.
    pub fn is_enabled(&self, action: &str) -> bool {
        match action {
            "reconnect-connection" => self.reconnect_connection,
            "reconnect-voice" => self.reconnect_voice,
            "restart-stream" => self.restart_stream,
            "memory-cleanup" => self.memory_cleanup,
            "restart-encoder" => self.restart_encoder,
            "network-reset" => self.network_reset,
            _ => false,
        }
    }
}

/// Automatic recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryConfig {
    /// Master switch for automatic recovery
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ceiling on recovery attempts within a rolling hour
    #[serde(default = "default_max_retries_per_hour")]
    pub max_retries_per_hour: u32,
    /// Consecutive encoder errors that trigger an escalated recovery
    #[serde(default = "default_critical_error_threshold")]
    pub critical_error_threshold: u32,
    /// Consecutive fully-failed batches after which the process exits
    #[serde(default = "default_auto_restart_threshold")]
    pub auto_restart_threshold: u32,
    /// Delay between actions of one batch in milliseconds
    #[serde(default = "default_action_delay_ms")]
    pub action_delay_ms: u64,
    /// Seconds after a stream start during which only reconnects are allowed
    #[serde(default = "default_recovery_grace_secs")]
    pub grace_period_secs: u64,
    #[serde(default)]
    pub actions: RecoveryActionsConfig,
}

fn default_max_retries_per_hour() -> u32 {
    10
}

fn default_critical_error_threshold() -> u32 {
    5
}

fn default_auto_restart_threshold() -> u32 {
    3
}

fn default_action_delay_ms() -> u64 {
    2000
}

fn default_recovery_grace_secs() -> u64 {
    30
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries_per_hour: default_max_retries_per_hour(),
            critical_error_threshold: default_critical_error_threshold(),
            auto_restart_threshold: default_auto_restart_threshold(),
            action_delay_ms: default_action_delay_ms(),
            grace_period_secs: default_recovery_grace_secs(),
            actions: RecoveryActionsConfig::default(),
        }
    }
}

/// Default encode profile and planning switches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,
    #[serde(default = "default_max_bitrate_kbps")]
    pub max_bitrate_kbps: u32,
    #[serde(default = "default_codec")]
    pub codec: String,
    /// Use the hardware encoder (NVENC) and its higher bitrate table
    #[serde(default)]
    pub hardware_acceleration: bool,
    /// Probe each source and plan the profile from it
    #[serde(default = "default_true")]
    pub adaptive_settings: bool,
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_fps() -> u32 {
    30
}

fn default_bitrate_kbps() -> u32 {
    2500
}

fn default_max_bitrate_kbps() -> u32 {
    3250
}

fn default_codec() -> String {
    "h264".to_string()
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            bitrate_kbps: default_bitrate_kbps(),
            max_bitrate_kbps: default_max_bitrate_kbps(),
            codec: default_codec(),
            hardware_acceleration: false,
            adaptive_settings: true,
        }
    }
}

/// External encoder and probe process configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: String,
    #[serde(default = "default_ffprobe_binary")]
    pub ffprobe_binary: String,
    /// Hard timeout for a source probe
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// How long a new pipeline may take to produce its first output
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    /// How long a retired pipeline may drain before it is killed
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Grace between the termination signal and a hard kill on stop
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    /// Downstream sink: `-` for stdout, `tcp://host:port`, or a file path
    #[serde(default = "default_output")]
    pub output: String,
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_binary() -> String {
    "ffprobe".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    15
}

fn default_start_timeout_secs() -> u64 {
    20
}

fn default_drain_timeout_ms() -> u64 {
    3000
}

fn default_terminate_grace_ms() -> u64 {
    5000
}

fn default_output() -> String {
    "-".to_string()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_binary: default_ffmpeg_binary(),
            ffprobe_binary: default_ffprobe_binary(),
            probe_timeout_secs: default_probe_timeout_secs(),
            start_timeout_secs: default_start_timeout_secs(),
            drain_timeout_ms: default_drain_timeout_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
            output: default_output(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub encode: EncodeConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
}

/// Accept "true", "1", "yes" as true; "false", "0", "no" as false
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
    /// Parses the config file and handles missing optional fields with defaults.
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
    /// - RELAY_LISTEN -> server.listen
    /// - RELAY_RECOVERY_ENDPOINTS -> server.recovery_endpoints
    /// - RELAY_HEALTH_CHECK_INTERVAL_SECS -> health.check_interval_secs
    /// - RELAY_AUTO_RECOVERY -> recovery.enabled
    /// - RELAY_MAX_RETRIES_PER_HOUR -> recovery.max_retries_per_hour
    /// - RELAY_HARDWARE_ACCELERATION -> encode.hardware_acceleration
    /// - RELAY_ADAPTIVE_SETTINGS -> encode.adaptive_settings
    /// - RELAY_FFMPEG_BINARY -> encoder.ffmpeg_binary
    ///
    /// Values that fail to parse leave the existing setting untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RELAY_LISTEN") {
            if !val.trim().is_empty() {
                self.server.listen = val;
            }
        }

        if let Some(flag) = env::var("RELAY_RECOVERY_ENDPOINTS").ok().and_then(|v| parse_bool(&v)) {
            self.server.recovery_endpoints = flag;
        }

        if let Ok(val) = env::var("RELAY_HEALTH_CHECK_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.health.check_interval_secs = secs;
            }
        }

        if let Some(flag) = env::var("RELAY_AUTO_RECOVERY").ok().and_then(|v| parse_bool(&v)) {
            self.recovery.enabled = flag;
        }

        if let Ok(val) = env::var("RELAY_MAX_RETRIES_PER_HOUR") {
            if let Ok(max) = val.parse::<u32>() {
                self.recovery.max_retries_per_hour = max;
            }
        }

        if let Some(flag) = env::var("RELAY_HARDWARE_ACCELERATION").ok().and_then(|v| parse_bool(&v)) {
            self.encode.hardware_acceleration = flag;
        }

        if let Some(flag) = env::var("RELAY_ADAPTIVE_SETTINGS").ok().and_then(|v| parse_bool(&v)) {
            self.encode.adaptive_settings = flag;
        }

        if let Ok(val) = env::var("RELAY_FFMPEG_BINARY") {
            if !val.trim().is_empty() {
                self.encoder.ffmpeg_binary = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}
