//! Configuration management for Floodgate.
//!
//! Values come from an optional file layered under `FLOODGATE__*`
//! environment variables (`FLOODGATE__SERVER__LISTEN_ADDR=0.0.0.0:51234`).

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::admission::FailureMode;
use crate::error::{FloodgateError, Result};
use crate::protocol::{DEFAULT_MAX_FRAME_BYTES, DEFAULT_PORT};
use crate::ratelimit::PolicySpec;

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Where the auth token is persisted
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Policies registered at startup
    #[serde(default)]
    pub policies: Vec<PolicySpec>,

    /// Behaviour when the limiter cannot be reached; no default on purpose
    #[serde(default)]
    pub admission: Option<AdmissionConfig>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to accept client connections on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Eviction sweep cadence in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// How long a new connection has to authenticate, in milliseconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Largest accepted frame in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            sweep_interval_secs: default_sweep_interval(),
            handshake_timeout_ms: default_handshake_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == 0 {
            return Err(FloodgateError::Configuration(
                "server.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.handshake_timeout_ms == 0 || self.max_frame_bytes == 0 {
            return Err(FloodgateError::Configuration(
                "server handshake timeout and frame size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT))
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_handshake_timeout() -> u64 {
    5_000
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// `host:port` of the server
    #[serde(default = "default_server_addr")]
    pub server_addr: String,

    /// Per-call deadline in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_min")]
    pub reconnect_min_ms: u64,

    /// Ceiling for the reconnect delay in milliseconds
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,

    /// Reconnect attempts before the client closes for good; 0 retries forever
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Keepalive ping cadence in milliseconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,

    /// Largest accepted frame in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            request_timeout_ms: default_request_timeout(),
            reconnect_min_ms: default_reconnect_min(),
            reconnect_max_ms: default_reconnect_max(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            keepalive_interval_ms: default_keepalive_interval(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl ClientConfig {
    /// Defaults pointed at a specific server.
    pub fn for_server(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// `None` when reconnecting never gives up.
    pub fn reconnect_attempts(&self) -> Option<u32> {
        (self.max_reconnect_attempts > 0).then_some(self.max_reconnect_attempts)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_addr.is_empty() {
            return Err(FloodgateError::Configuration(
                "client.server_addr must be set".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 || self.keepalive_interval_ms == 0 {
            return Err(FloodgateError::Configuration(
                "client timeouts must be greater than 0".to_string(),
            ));
        }
        if self.reconnect_min_ms == 0 || self.reconnect_min_ms > self.reconnect_max_ms {
            return Err(FloodgateError::Configuration(format!(
                "client reconnect delay must satisfy 0 < min ({}ms) <= max ({}ms)",
                self.reconnect_min_ms, self.reconnect_max_ms
            )));
        }
        Ok(())
    }
}

fn default_server_addr() -> String {
    format!("127.0.0.1:{}", DEFAULT_PORT)
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_reconnect_min() -> u64 {
    10_000
}

fn default_reconnect_max() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_keepalive_interval() -> u64 {
    25_000
}

/// Persistent storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding key-value records
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(".floodgate")
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text
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

fn default_log_level() -> String {
    "info".to_string()
}

/// Admission configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Whether requests pass or fail while the limiter is unreachable
    pub on_unavailable: FailureMode,
}

impl FloodgateConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("FLOODGATE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: FloodgateConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| FloodgateError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the server or client unusable.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.client.validate()?;
        for spec in &self.policies {
            if spec.limit == Some(0) || spec.interval == Some(0) {
                return Err(FloodgateError::Configuration(format!(
                    "policy '{}' must have a positive limit and interval",
                    spec.group.as_deref().unwrap_or(crate::ratelimit::DEFAULT_GROUP)
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("floodgate-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = FloodgateConfig::default();
        assert_eq!(config.server.listen_addr.port(), 51234);
        assert_eq!(config.server.sweep_interval(), Duration::from_secs(3600));
        assert_eq!(config.client.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.client.reconnect_min(), Duration::from_secs(10));
        assert_eq!(config.client.reconnect_max(), Duration::from_secs(30));
        assert!(config.admission.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_file() {
        let path = write_temp(
            "floodgate.yaml",
            r#"
server:
  listen_addr: "0.0.0.0:6000"
client:
  request_timeout_ms: 2500
policies:
  - group: login
    limit: 3
    interval: 5
admission:
  on_unavailable: closed
"#,
        );

        let config = FloodgateConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(config.server.listen_addr.port(), 6000);
        assert_eq!(config.client.request_timeout(), Duration::from_millis(2500));
        assert_eq!(config.client.reconnect_max_ms, 30_000);
        assert_eq!(config.policies.len(), 1);
        assert_eq!(config.policies[0].limit, Some(3));
        assert_eq!(
            config.admission.map(|a| a.on_unavailable),
            Some(FailureMode::Closed)
        );
    }

    #[test]
    fn test_admission_mode_must_be_known() {
        let path = write_temp("floodgate.yaml", "admission:\n  on_unavailable: sometimes\n");
        assert!(matches!(
            FloodgateConfig::load(Some(path.as_path())),
            Err(FloodgateError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let path = std::env::temp_dir().join(format!("floodgate-missing-{}.yaml", uuid::Uuid::new_v4()));
        assert!(matches!(
            FloodgateConfig::load(Some(path.as_path())),
            Err(FloodgateError::Configuration(_))
        ));
    }

    #[test]
    fn test_server_validate_rejects_zero_values() {
        let server = ServerConfig {
            sweep_interval_secs: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            server.validate(),
            Err(FloodgateError::Configuration(_))
        ));

        let server = ServerConfig {
            handshake_timeout_ms: 0,
            ..ServerConfig::default()
        };
        assert!(server.validate().is_err());
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = FloodgateConfig::default();
        config.client.reconnect_min_ms = 40_000;
        assert!(matches!(
            config.validate(),
            Err(FloodgateError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_policy_fields() {
        let mut config = FloodgateConfig::default();
        config.policies.push(PolicySpec::group("x").with_limit(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_attempts_zero_means_forever() {
        let mut client = ClientConfig::default();
        assert_eq!(client.reconnect_attempts(), Some(10));
        client.max_reconnect_attempts = 0;
        assert_eq!(client.reconnect_attempts(), None);
    }
}
