//! TOML-based configuration for the VPN daemon.
//!
//! Reads and writes `DaemonConfig` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\VpnDaemon\config.toml`
//! - Linux:    `~/.config/vpn-daemon/config.toml`
//! - macOS:    `~/Library/Application Support/VpnDaemon/config.toml`
//!
//! An explicit path given on the command line replaces the platform default.
//!
//! Example:
//!
//! ```toml
//! [daemon]
//! log_level = "debug"
//!
//! [api]
//! base_url = "https://api.example.net"
//!
//! [tunnel]
//! relay = "se-got-wg-001"
//! endpoint = "185.213.154.68:51820"
//! up_command = "/usr/local/libexec/vpn-up"
//! down_command = "/usr/local/libexec/vpn-down"
//! auto_connect = true
//!
//! [account]
//! key_rotation_interval_secs = 604800
//! ```
//!
//! # Serde default values
//!
//! Every field carries `#[serde(default = "some_fn")]`, so a missing file, a
//! missing section, or a missing key all fall back to the built-in default.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use vpn_core::RetryPolicy;

use crate::application::session_manager::{
    ManagerConfig, AUTH_FAILURE_RECONNECT_DELAY, DEFAULT_KEY_ROTATION_INTERVAL,
};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but makes no sense, e.g. an unparseable endpoint.
    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level daemon configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: GeneralConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub account: AccountConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Where `device.json` lives.  Defaults to the config directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Retry policy for account API calls and tunnel establishment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first.  `1` disables retries.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    /// Adds up to this fraction of random extra delay to each backoff.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelConfig {
    #[serde(default = "default_relay")]
    pub relay: String,
    /// `ip:port` of the relay.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Shell command that brings the tunnel up.  Unset means the in-memory
    /// backend is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down_command: Option<String>,
    /// Whether a failure without its own classification blocks traffic.
    #[serde(default = "default_true")]
    pub block_on_error: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Connect at startup even if the tunnel was down at shutdown.
    #[serde(default)]
    pub auto_connect: bool,
    #[serde(default = "default_establish_timeout_secs")]
    pub establish_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountConfig {
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,
    /// Seconds between background device checks.  `0` disables them.
    #[serde(default = "default_device_check_interval_secs")]
    pub device_check_interval_secs: u64,
    /// Access tokens this close to expiry are refreshed before use.
    #[serde(default = "default_token_refresh_margin_secs")]
    pub token_refresh_margin_secs: u64,
    /// Key age in seconds at which the device key is rotated.  `0` disables
    /// automatic rotation.
    #[serde(default = "default_key_rotation_interval_secs")]
    pub key_rotation_interval_secs: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_base_url() -> String {
    "https://api.mullvad.net".to_string()
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> u32 {
    2
}
fn default_jitter() -> f64 {
    0.1
}
fn default_relay() -> String {
    "se-got-wg-001".to_string()
}
fn default_endpoint() -> String {
    "185.213.154.68:51820".to_string()
}
fn default_true() -> bool {
    true
}
fn default_establish_timeout_secs() -> u64 {
    30
}
fn default_max_devices() -> usize {
    5
}
fn default_device_check_interval_secs() -> u64 {
    24 * 60 * 60
}
fn default_token_refresh_margin_secs() -> u64 {
    60
}
fn default_key_rotation_interval_secs() -> u64 {
    DEFAULT_KEY_ROTATION_INTERVAL.as_secs()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            cache_dir: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            relay: default_relay(),
            endpoint: default_endpoint(),
            up_command: None,
            down_command: None,
            block_on_error: default_true(),
            auto_reconnect: default_true(),
            auto_connect: false,
            establish_timeout_secs: default_establish_timeout_secs(),
        }
    }
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            max_devices: default_max_devices(),
            device_check_interval_secs: default_device_check_interval_secs(),
            token_refresh_margin_secs: default_token_refresh_margin_secs(),
            key_rotation_interval_secs: default_key_rotation_interval_secs(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_multiplier(self.multiplier)
        .with_jitter(self.jitter)
    }
}

impl TunnelConfig {
    /// Parses the configured relay endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `endpoint` is not an `ip:port` pair.
    pub fn endpoint_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.endpoint
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                key: "tunnel.endpoint",
                reason: format!("{:?}: {e}", self.endpoint),
            })
    }
}

impl DaemonConfig {
    /// Builds the session manager settings from this file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unparseable endpoint.
    pub fn manager_config(&self) -> Result<ManagerConfig, ConfigError> {
        let interval = self.account.device_check_interval_secs;
        let rotation = self.account.key_rotation_interval_secs;
        Ok(ManagerConfig {
            relay: self.tunnel.relay.clone(),
            endpoint: self.tunnel.endpoint_addr()?,
            connect_policy: self.retry.policy(),
            block_on_error: self.tunnel.block_on_error,
            auto_reconnect: self.tunnel.auto_reconnect,
            max_devices: self.account.max_devices,
            device_check_interval: (interval > 0).then(|| Duration::from_secs(interval)),
            auth_failure_reconnect_delay: AUTH_FAILURE_RECONNECT_DELAY,
            key_rotation_interval: (rotation > 0).then(|| Duration::from_secs(rotation)),
            auto_connect: self.tunnel.auto_connect,
        })
    }

    /// Directory holding the device cache.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoPlatformConfigDir`] when no override is set
    /// and the platform directory is unknown.
    pub fn cache_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.daemon.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => config_dir(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads `DaemonConfig` from `path`, or from the platform default when
/// `path` is `None`.  A missing file yields `DaemonConfig::default()`.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: Option<&Path>) -> Result<DaemonConfig, ConfigError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config_file_path()?,
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DaemonConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Writes `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &DaemonConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("VpnDaemon"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("vpn-daemon"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("VpnDaemon")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
