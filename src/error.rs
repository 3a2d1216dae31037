//! Error types for the GNSS logger using snafu.
//!
//! Each concern gets its own enum so that the reconciler can decide, per
//! failure kind, whether to drop, buffer, retain or stop.

use snafu::prelude::*;

/// Boxed cause carried by sink errors, independent of the sink backend.
pub type SinkCause = Box<dyn std::error::Error + Send + Sync>;

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// A required sink setting is missing or empty.
    #[snafu(display("Sink setting '{field}' is required"))]
    MissingSinkSetting { field: &'static str },

    /// Serial device path is empty.
    #[snafu(display("Serial device path cannot be empty"))]
    EmptyDevicePath,

    /// Buffer file path is empty.
    #[snafu(display("Buffer path cannot be empty"))]
    EmptyBufferPath,

    /// A numeric setting that must be positive was zero.
    #[snafu(display("Setting '{field}' must be greater than zero"))]
    ZeroSetting { field: &'static str },

    /// Table name is not a plain SQL identifier.
    #[snafu(display("Invalid table name: {table}"))]
    InvalidTableName { table: String },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },
}

// ============ Parse Errors ============

/// A sentence or buffered row that could not be turned into a fix.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ParseError {
    /// Sentence has fewer fields than required.
    #[snafu(display("{sentence} sentence has {found} fields, expected at least {expected}"))]
    TooFewFields {
        sentence: &'static str,
        expected: usize,
        found: usize,
    },

    /// A numeric field did not parse.
    #[snafu(display("Invalid {field} value '{value}': {source}"))]
    InvalidNumber {
        field: &'static str,
        value: String,
        source: std::num::ParseFloatError,
    },

    /// A hemisphere indicator was not N/S/E/W.
    #[snafu(display("Invalid hemisphere '{value}'"))]
    InvalidHemisphere { value: String },

    /// Buffered timestamp did not parse.
    #[snafu(display("Invalid timestamp '{value}'"))]
    InvalidTimestamp { value: String },

    /// Buffered row has the wrong number of columns.
    #[snafu(display("Buffered row has {found} columns, expected {expected}"))]
    ColumnCount { expected: usize, found: usize },
}

// ============ Source Errors ============

/// Errors from the serial line source.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// Could not open the serial device.
    #[snafu(display("Failed to open serial device {device}: {source}"))]
    OpenDevice {
        device: String,
        source: tokio_serial::Error,
    },

    /// Reading from the device failed.
    #[snafu(display("Failed to read from {device}: {source}"))]
    ReadLine {
        device: String,
        source: std::io::Error,
    },
}

// ============ Sink Errors ============

/// Errors from a sink connector.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// Opening or re-opening the connection failed.
    #[snafu(display("Sink unavailable: {source}"))]
    SinkUnavailable { source: SinkCause },

    /// An operation was attempted without an open connection.
    #[snafu(display("Sink connection is not open"))]
    NotOpen,

    /// The sink rejected a single row.
    #[snafu(display("Insert rejected for row {row}: {source}"))]
    Insert { row: String, source: SinkCause },

    /// The connection broke while talking to the sink.
    #[snafu(display("Sink connection lost: {source}"))]
    ConnectionLost { source: SinkCause },

    /// Committing the pending inserts failed.
    #[snafu(display("Commit failed: {source}"))]
    Commit { source: SinkCause },
}

impl SinkError {
    /// True when the session itself is unusable, as opposed to one bad row.
    pub fn is_connection_fault(&self) -> bool {
        !matches!(self, SinkError::Insert { .. })
    }
}

// ============ Buffer Errors ============

/// Errors from the durable buffer file.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BufferError {
    /// Writing or replacing the buffer file failed.
    #[snafu(display("Failed to write buffer {path}: {source}"))]
    BufferWrite {
        path: String,
        source: std::io::Error,
    },

    /// Encoding a row failed.
    #[snafu(display("Failed to encode buffer row for {path}: {source}"))]
    BufferEncode { path: String, source: csv::Error },

    /// Reading the buffer file failed.
    #[snafu(display("Failed to read buffer {path}: {source}"))]
    BufferRead { path: String, source: csv::Error },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Could not bind the metrics listener.
    #[snafu(display("Failed to bind metrics server to {addr}: {source}"))]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder: {source}"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ Pipeline Error (top-level) ============

/// Startup and run-loop errors that end the process.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Serial source error.
    #[snafu(display("Source error: {source}"))]
    Source { source: SourceError },

    /// Failed to parse metrics address.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },
}
