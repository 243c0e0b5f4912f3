use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Placeholder shipped as the default connection string. Accepted at startup
/// so the node can come up without credentials; every upload then fails.
pub const PLACEHOLDER_CONNECTION_STRING: &str = "YOUR_CONNECTION_STRING";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_connection_string")]
    pub connection_string: String,
    #[serde(default = "default_container_name")]
    pub container_name: String,
    /// Prepended to every object name. Empty by default.
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Minimum number of seconds between two uploaded frames.
    #[serde(default = "default_upload_interval")]
    pub upload_interval: f64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection_string: default_connection_string(),
            container_name: default_container_name(),
            prefix: String::new(),
            force_path_style: default_force_path_style(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            queue_depth: default_queue_depth(),
            upload_interval: default_upload_interval(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject values the node cannot run with. Called once at startup,
    /// after every override has been applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.capture.interval()?;
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "jpeg_quality must be within 1..=100, got {}",
                self.capture.jpeg_quality
            )));
        }
        if self.capture.queue_depth == 0 {
            return Err(ConfigError::Invalid("queue_depth must be at least 1".into()));
        }
        if self.store.container_name.trim().is_empty() {
            return Err(ConfigError::Invalid("container_name must not be empty".into()));
        }
        if !self.store.uses_placeholder() {
            ConnectionString::parse(&self.store.connection_string)?;
        }
        Ok(())
    }
}

impl StoreConfig {
    pub fn uses_placeholder(&self) -> bool {
        self.connection_string == PLACEHOLDER_CONNECTION_STRING
    }
}

impl CaptureConfig {
    pub fn interval(&self) -> Result<Duration, ConfigError> {
        Duration::try_from_secs_f64(self.upload_interval).map_err(|_| {
            ConfigError::Invalid(format!(
                "upload_interval must be a finite, non-negative number of seconds, got {}",
                self.upload_interval
            ))
        })
    }
}

/// Parsed form of the store connection string.
///
/// Format: `;`-separated `Key=Value` pairs, keys matched case-insensitively:
/// `Endpoint`, `AccessKey`, `SecretKey` and `Region`. Empty segments are
/// ignored so a trailing `;` is fine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub region: String,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut parsed = Self {
            endpoint: None,
            access_key: None,
            secret_key: None,
            region: default_region(),
        };

        for segment in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                ConfigError::ConnectionString(format!("segment `{segment}` is not Key=Value"))
            })?;
            let value = value.trim().to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "endpoint" => parsed.endpoint = Some(value),
                "accesskey" => parsed.access_key = Some(value),
                "secretkey" => parsed.secret_key = Some(value),
                "region" => parsed.region = value,
                other => {
                    return Err(ConfigError::ConnectionString(format!("unknown key `{other}`")));
                }
            }
        }

        if parsed.access_key.is_some() != parsed.secret_key.is_some() {
            return Err(ConfigError::ConnectionString(
                "AccessKey and SecretKey must be given together".into(),
            ));
        }
        if parsed.region.is_empty() {
            return Err(ConfigError::ConnectionString("Region must not be empty".into()));
        }
        Ok(parsed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid connection string: {0}")]
    ConnectionString(String),
}

// Default value functions
fn default_connection_string() -> String {
    PLACEHOLDER_CONNECTION_STRING.into()
}
fn default_container_name() -> String {
    "robot-images".into()
}
fn default_force_path_style() -> bool {
    true
}
fn default_topic() -> String {
    "/camera/image_raw".into()
}
fn default_queue_depth() -> usize {
    10
}
fn default_upload_interval() -> f64 {
    5.0
}
fn default_jpeg_quality() -> u8 {
    95
}
fn default_region() -> String {
    "us-east-1".into()
}
fn default_log_level() -> String {
    "info".into()
}
