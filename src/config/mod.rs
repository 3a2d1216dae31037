//! Configuration loading and validation.
//!
//! Configuration is a YAML file with `${VAR}` style environment interpolation,
//! so credentials can stay in the environment:
//!
//! ```yaml
//! source:
//!   device: ${SERIAL_PORT:-/dev/serial0}
//!   baud_rate: 9600
//! sink:
//!   host: ${DB_HOST}
//!   database: ${DB_NAME}
//!   user: ${DB_USER}
//!   password: ${DB_PASSWORD}
//! buffer:
//!   path: buffer.csv
//! ```

mod vars;

use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::{
    ConfigError, EmptyBufferPathSnafu, EmptyDevicePathSnafu, EnvInterpolationSnafu,
    InvalidTableNameSnafu, MissingSinkSettingSnafu, ReadFileSnafu, YamlParseSnafu,
    ZeroSettingSnafu,
};

static TABLE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("Invalid regex pattern")
});

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    /// Metrics configuration (optional, disabled by default).
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Serial device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Serial device path (default: "/dev/serial0").
    #[serde(default = "default_device")]
    pub device: String,
    /// Baud rate (default: 9600).
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud_rate: default_baud_rate(),
        }
    }
}

fn default_device() -> String {
    "/dev/serial0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

/// PostgreSQL connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: Secret,
    #[serde(default)]
    pub tls_mode: TlsMode,
    /// Target table (default: "gnss_data").
    #[serde(default = "default_table")]
    pub table: String,
}

fn default_port() -> u16 {
    5432
}

fn default_table() -> String {
    "gnss_data".to_string()
}

/// TLS requirement for the sink connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    Disable,
    Prefer,
    #[default]
    Require,
    VerifyCa,
    VerifyFull,
}

/// A string that never shows up in logs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"***\"")
    }
}

/// Local backlog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Buffer file path (default: "buffer.csv").
    #[serde(default = "default_buffer_path")]
    pub path: PathBuf,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            path: default_buffer_path(),
        }
    }
}

fn default_buffer_path() -> PathBuf {
    PathBuf::from("buffer.csv")
}

/// What to persist as speed when no RMC sentence has been seen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpeedPolicy {
    /// Store NULL.
    Absent,
    /// Store 0.0.
    #[default]
    Zero,
    /// Store the last speed seen on an earlier fix, NULL if there is none.
    LastKnown,
}

/// Drain timing and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Seconds between periodic probe-and-drain runs (default: 30).
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,
    #[serde(default)]
    pub speed_policy: SpeedPolicy,
    /// Seconds to wait after a serial read error (default: 2).
    #[serde(default = "default_read_error_backoff_secs")]
    pub read_error_backoff_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            drain_interval_secs: default_drain_interval_secs(),
            speed_policy: SpeedPolicy::default(),
            read_error_backoff_secs: default_read_error_backoff_secs(),
        }
    }
}

impl ReconcilerConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    pub fn read_error_backoff(&self) -> Duration {
        Duration::from_secs(self.read_error_backoff_secs)
    }
}

fn default_drain_interval_secs() -> u64 {
    30
}

fn default_read_error_backoff_secs() -> u64 {
    2
}

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is served (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration text, interpolating environment variables first.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let result = vars::interpolate(content);
        if !result.is_ok() {
            return EnvInterpolationSnafu {
                message: result.errors.join("\n"),
            }
            .fail();
        }

        let config: Config = serde_yaml::from_str(&result.text).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Missing sink credentials are fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sink = &self.sink;
        ensure!(!sink.host.is_empty(), MissingSinkSettingSnafu { field: "host" });
        ensure!(
            !sink.database.is_empty(),
            MissingSinkSettingSnafu { field: "database" }
        );
        ensure!(!sink.user.is_empty(), MissingSinkSettingSnafu { field: "user" });
        ensure!(
            !sink.password.is_empty(),
            MissingSinkSettingSnafu { field: "password" }
        );
        ensure!(
            TABLE_NAME.is_match(&sink.table),
            InvalidTableNameSnafu {
                table: sink.table.clone()
            }
        );

        ensure!(!self.source.device.is_empty(), EmptyDevicePathSnafu);
        ensure!(self.source.baud_rate > 0, ZeroSettingSnafu { field: "baud_rate" });
        ensure!(!self.buffer.path.as_os_str().is_empty(), EmptyBufferPathSnafu);
        ensure!(
            self.reconciler.drain_interval_secs > 0,
            ZeroSettingSnafu {
                field: "drain_interval_secs"
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
sink:
  host: db.example.com
  database: telemetry
  user: logger
  password: hunter2
"#;

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();

        assert_eq!(config.source.device, "/dev/serial0");
        assert_eq!(config.source.baud_rate, 9600);
        assert_eq!(config.sink.port, 5432);
        assert_eq!(config.sink.table, "gnss_data");
        assert_eq!(config.sink.tls_mode, TlsMode::Require);
        assert_eq!(config.buffer.path, PathBuf::from("buffer.csv"));
        assert_eq!(config.reconciler.drain_interval(), Duration::from_secs(30));
        assert_eq!(config.reconciler.speed_policy, SpeedPolicy::Zero);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
source:
  device: /dev/ttyUSB0
  baud_rate: 38400
sink:
  host: localhost
  port: 6543
  database: gnss
  user: writer
  password: secret
  tls_mode: disable
  table: tracking.fixes
buffer:
  path: /var/lib/gnss/backlog.csv
reconciler:
  drain_interval_secs: 5
  speed_policy: last_known
metrics:
  enabled: true
  address: 127.0.0.1:9100
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.source.baud_rate, 38400);
        assert_eq!(config.sink.tls_mode, TlsMode::Disable);
        assert_eq!(config.sink.table, "tracking.fixes");
        assert_eq!(config.reconciler.speed_policy, SpeedPolicy::LastKnown);
        assert_eq!(config.reconciler.drain_interval(), Duration::from_secs(5));
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let yaml = r#"
sink:
  host: db.example.com
  database: telemetry
  user: logger
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingSinkSetting { field: "password" }
        ));
    }

    #[test]
    fn test_invalid_table_rejected() {
        let yaml = format!("{MINIMAL}  table: \"gnss; DROP TABLE x\"\n");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTableName { .. }));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let yaml = format!("{MINIMAL}reconciler:\n  drain_interval_secs: 0\n");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ZeroSetting {
                field: "drain_interval_secs"
            }
        ));
    }

    #[test]
    fn test_password_is_redacted() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        let debug = format!("{:?}", config.sink);
        assert!(!debug.contains("hunter2"));
        assert_eq!(config.sink.password.expose(), "hunter2");
    }
}
