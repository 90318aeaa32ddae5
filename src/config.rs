//! Configuration for the AQIoT agent.
//!
//! Two layers live here:
//!
//! - [`AgentSettings`]: process settings read from environment variables
//!   (file locations, sensor device, retry timing).
//! - [`OperatingConfig`]: the device's operating parameters, loaded from and
//!   persisted to a JSON file through a [`ConfigStore`]. These are the values
//!   the remote configuration source may change at runtime.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default location of the operating config file
const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Default remote configuration document
pub const DEFAULT_REMOTE_CONFIG_URL: &str = "https://krupp.dev/aqiot/config.json";

/// Default serial device the PMS5003 is attached to
const DEFAULT_SENSOR_DEVICE: &str = "/dev/ttyS0";

/// Default time allowed for one sensor frame to arrive
const DEFAULT_SENSOR_TIMEOUT_MS: u64 = 2_000;
const MIN_SENSOR_TIMEOUT_MS: u64 = 10;
const MAX_SENSOR_TIMEOUT_MS: u64 = 60_000;

/// Default pause before every sensor read attempt
const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
const MAX_RETRY_DELAY_MS: u64 = 60_000;

/// Consecutive failures tolerated before a remote escalation is sent
const DEFAULT_ESCALATION_THRESHOLD: u32 = 100;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const MIN_REQUEST_TIMEOUT_SECS: u64 = 1;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Errors raised while loading, validating or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error for {var}: {message}")]
    Env { var: &'static str, message: String },
}

/// Process-level settings for the agent.
///
/// All settings can be configured via environment variables:
/// - `AQIOT_CONFIG_PATH`: operating config file (default: config.json)
/// - `AQIOT_REMOTE_CONFIG_URL`: remote config document (default: https://krupp.dev/aqiot/config.json)
/// - `AQIOT_SENSOR_DEVICE`: serial device of the PM sensor (default: /dev/ttyS0)
/// - `AQIOT_SENSOR_TIMEOUT_MS`: time allowed for one frame (default: 2000)
/// - `AQIOT_RETRY_DELAY_MS`: pause before each read attempt (default: 1000)
/// - `AQIOT_ESCALATION_THRESHOLD`: failures before escalating (default: 100)
/// - `AQIOT_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: 30)
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Path of the JSON file holding the [`OperatingConfig`]
    pub config_path: PathBuf,

    /// URL of the remote configuration document, fetched unauthenticated
    pub remote_config_url: String,

    /// Serial device the sensor is attached to
    pub sensor_device: PathBuf,

    /// Time allowed for a single sensor frame
    pub sensor_timeout: Duration,

    /// Fixed delay before each sensor read attempt
    pub retry_delay: Duration,

    /// Consecutive read failures tolerated before escalating
    pub escalation_threshold: u32,

    /// HTTP request timeout
    pub request_timeout: Duration,
}

impl AgentSettings {
    /// Load settings from environment variables, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Env` if a numeric variable does not parse or is
    /// out of bounds, or if `AQIOT_REMOTE_CONFIG_URL` is not a valid URL.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("AQIOT_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let remote_config_url = env::var("AQIOT_REMOTE_CONFIG_URL")
            .unwrap_or_else(|_| DEFAULT_REMOTE_CONFIG_URL.to_string());
        Url::parse(&remote_config_url).map_err(|e| ConfigError::Env {
            var: "AQIOT_REMOTE_CONFIG_URL",
            message: e.to_string(),
        })?;

        let sensor_device = env::var("AQIOT_SENSOR_DEVICE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SENSOR_DEVICE));

        let sensor_timeout_ms = parse_bounded(
            "AQIOT_SENSOR_TIMEOUT_MS",
            DEFAULT_SENSOR_TIMEOUT_MS,
            MIN_SENSOR_TIMEOUT_MS,
            MAX_SENSOR_TIMEOUT_MS,
        )?;

        let retry_delay_ms =
            parse_bounded("AQIOT_RETRY_DELAY_MS", DEFAULT_RETRY_DELAY_MS, 0, MAX_RETRY_DELAY_MS)?;

        let escalation_threshold = parse_bounded(
            "AQIOT_ESCALATION_THRESHOLD",
            DEFAULT_ESCALATION_THRESHOLD as u64,
            1,
            u32::MAX as u64,
        )? as u32;

        let request_timeout_secs = parse_bounded(
            "AQIOT_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
            MIN_REQUEST_TIMEOUT_SECS,
            MAX_REQUEST_TIMEOUT_SECS,
        )?;

        Ok(Self {
            config_path,
            remote_config_url,
            sensor_device,
            sensor_timeout: Duration::from_millis(sensor_timeout_ms),
            retry_delay: Duration::from_millis(retry_delay_ms),
            escalation_threshold,
            request_timeout: Duration::from_secs(request_timeout_secs),
        })
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            remote_config_url: DEFAULT_REMOTE_CONFIG_URL.to_string(),
            sensor_device: PathBuf::from(DEFAULT_SENSOR_DEVICE),
            sensor_timeout: Duration::from_millis(DEFAULT_SENSOR_TIMEOUT_MS),
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

/// Parse an optional numeric environment variable within `[min, max]`.
fn parse_bounded(var: &'static str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
    let value = match env::var(var) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };

    let parsed: u64 = value.trim().parse().map_err(|_| ConfigError::Env {
        var,
        message: format!("'{}' is not a valid number", value),
    })?;

    if parsed < min {
        return Err(ConfigError::Env {
            var,
            message: format!("{} is below minimum ({})", parsed, min),
        });
    }

    if parsed > max {
        return Err(ConfigError::Env {
            var,
            message: format!("{} exceeds maximum ({})", parsed, max),
        });
    }

    Ok(parsed)
}

/// Operating parameters of the device.
///
/// `base_url` always ends with `/` and `interval_secs` is always positive.
/// Construct through [`OperatingConfig::new`] or deserialization to keep
/// those invariants.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawOperatingConfig")]
pub struct OperatingConfig {
    pub base_url: String,
    pub user_token: String,
    pub auth_token: String,
    #[serde(rename = "interval")]
    pub interval_secs: u64,
}

impl OperatingConfig {
    pub fn new(
        base_url: &str,
        user_token: impl Into<String>,
        auth_token: impl Into<String>,
        interval_secs: u64,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: normalize_base_url(base_url)?,
            user_token: user_token.into(),
            auth_token: auth_token.into(),
            interval_secs: validate_interval(interval_secs)?,
        })
    }

    /// Endpoint for a path relative to the base URL, e.g. `readings`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl std::fmt::Debug for OperatingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatingConfig")
            .field("base_url", &self.base_url)
            .field("user_token", &"<redacted>")
            .field("auth_token", &"<redacted>")
            .field("interval_secs", &self.interval_secs)
            .finish()
    }
}

/// On-disk shape; older files store `interval` as a string.
#[derive(Deserialize)]
struct RawOperatingConfig {
    base_url: String,
    user_token: String,
    auth_token: String,
    interval: IntervalField,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntervalField {
    Seconds(i64),
    Text(String),
}

impl TryFrom<RawOperatingConfig> for OperatingConfig {
    type Error = ConfigError;

    fn try_from(raw: RawOperatingConfig) -> Result<Self, Self::Error> {
        let interval = match raw.interval {
            IntervalField::Seconds(secs) => secs,
            IntervalField::Text(text) => text.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "interval",
                message: format!("'{}' is not a whole number of seconds", text),
            })?,
        };

        if interval <= 0 {
            return Err(ConfigError::Invalid {
                field: "interval",
                message: format!("{} must be greater than 0", interval),
            });
        }

        OperatingConfig::new(&raw.base_url, raw.user_token, raw.auth_token, interval as u64)
    }
}

/// Validate a base URL and make sure it ends with `/`.
pub fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed).map_err(|e| ConfigError::Invalid {
        field: "base_url",
        message: format!("'{}': {}", trimmed, e),
    })?;

    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ConfigError::Invalid {
            field: "base_url",
            message: format!("'{}' is not an http(s) origin", trimmed),
        });
    }

    let mut normalized = trimmed.to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Ok(normalized)
}

fn validate_interval(interval_secs: u64) -> Result<u64, ConfigError> {
    if interval_secs == 0 {
        return Err(ConfigError::Invalid {
            field: "interval",
            message: "must be greater than 0".to_string(),
        });
    }
    Ok(interval_secs)
}

/// Durable storage for the [`OperatingConfig`].
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self) -> Result<OperatingConfig, ConfigError>;

    /// Replace the stored config with `config` in full.
    async fn save(&self, config: &OperatingConfig) -> Result<(), ConfigError>;
}

/// [`ConfigStore`] backed by a pretty-printed JSON file.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load(&self) -> Result<OperatingConfig, ConfigError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ConfigError::Read {
                path: self.path.clone(),
                source,
            })?;

        let config: OperatingConfig = serde_json::from_str(&contents)?;
        debug!(path = %self.path.display(), "Operating config loaded");
        Ok(config)
    }

    async fn save(&self, config: &OperatingConfig) -> Result<(), ConfigError> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        config.serialize(&mut serializer)?;

        // Write to a sibling file first so a crash never leaves a torn config.
        let tmp = self.path.with_extension("json.tmp");
        let write_err = |source| ConfigError::Write {
            path: self.path.clone(),
            source,
        };
        tokio::fs::write(&tmp, &buf).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(write_err)?;

        debug!(path = %self.path.display(), "Operating config saved");
        Ok(())
    }
}
