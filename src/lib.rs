//! gnss-logger: NMEA GNSS logger with a crash-safe local buffer.
//!
//! Position fixes read from a serial receiver are inserted into a PostgreSQL
//! table. While the database is unreachable they are appended to a durable
//! CSV buffer, which is drained back into the table once it returns. Rows
//! the database rejects are kept in the buffer without blocking the rest.
//!
//! # Example
//!
//! ```ignore
//! use gnss_logger::{Config, run_logger};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), gnss_logger::error::PipelineError> {
//!     let config = Config::from_file("config.yaml").expect("valid config");
//!     let stats = run_logger(config, CancellationToken::new()).await?;
//!     println!("Buffered {} fixes", stats.reconciler.fixes_buffered);
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod fix;
pub mod metrics;
pub mod pipeline;
pub mod reconciler;
pub mod signal;
pub mod sink;
pub mod source;

pub use buffer::{BufferEntry, DurableBuffer};
pub use config::Config;
pub use fix::Fix;
pub use pipeline::{Pipeline, PipelineStats, run_logger};
pub use reconciler::{DrainReport, FixOutcome, Reconciler, ReconcilerStats};
pub use sink::{PostgresConnector, SessionState, SinkConnector};
#[cfg(any(test, feature = "test-util"))]
pub use sink::{MemoryConnector, MemorySink};
