//! Configuration loading and types for Chunkyard.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Every section is optional; missing keys fall back to
//! the defaults at the bottom of this file.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::engine::EngineOptions;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Upload storage and protocol settings.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Abandoned-upload expiry settings.
    #[serde(default)]
    pub expiry: ExpiryConfig,

    /// Settings for the built-in lifecycle hooks.
    #[serde(default)]
    pub hooks: HooksConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Engine tunables derived from the `upload` and `expiry` sections.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_size: self.upload.max_size,
            expiry_ttl: self.expiry.enabled.then(|| self.expiry.ttl()).flatten(),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Where uploads live and how they are addressed.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Directory holding payloads and their `.json` metadata.
    #[serde(default = "default_root_dir")]
    pub root_dir: String,

    /// Route prefix of the upload collection, e.g. `/files`.
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Maximum upload size in bytes (0 = unlimited).
    #[serde(default)]
    pub max_size: u64,

    /// Absolute prefix for `Location` URLs, e.g. `https://up.example.com`.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            base_path: default_base_path(),
            max_size: 0,
            public_base_url: None,
        }
    }
}

/// Expiry reaper configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExpiryConfig {
    /// Run the background reaper.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Idle lifetime of an incomplete upload in seconds (0 = never expires).
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Seconds between reaper sweeps.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl ExpiryConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_ttl_secs(),
            interval_secs: default_interval_secs(),
        }
    }
}

/// Built-in hook settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HooksConfig {
    /// Prefix for the public URL reported on completion.
    #[serde(default)]
    pub public_url: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1080
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_root_dir() -> String {
    "./data/uploads".to_string()
}

fn default_base_path() -> String {
    "/files".to_string()
}

fn default_ttl_secs() -> u64 {
    259_200 // 3 days
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

// ── Tests ────────────────────────────────────────────────────────────
