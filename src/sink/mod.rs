//! Sink connectors.
//!
//! A connector owns the connection to the remote store and exposes a small
//! transactional surface: make sure a session is open, insert one row,
//! commit everything inserted so far. The reconciler decides what to do when
//! any of these fail.

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::fix::Fix;

#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryConnector, MemorySink};
pub use postgres::PostgresConnector;

/// Outcome of [`SinkConnector::ensure_open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The existing session passed its liveness probe.
    Reused,
    /// A new session was opened.
    Opened,
}

/// Transactional write access to the remote sink.
///
/// Inserts accumulate in an open transaction until [`commit`](Self::commit).
/// A rejected row must not affect other rows in the same transaction.
#[async_trait]
pub trait SinkConnector: Send {
    /// Ensure a usable session exists, probing the current one and reopening
    /// it if it is missing, broken or fails the probe. Uncommitted inserts
    /// from a previous session are discarded.
    async fn ensure_open(&mut self) -> Result<SessionState, SinkError>;

    /// Insert one fix without committing.
    ///
    /// Returns [`SinkError::Insert`] if only this row was rejected, and a
    /// connection-level error if the session is no longer usable.
    async fn insert(&mut self, fix: &Fix) -> Result<(), SinkError>;

    /// Make all uncommitted inserts durable. On failure the session is
    /// broken and must be reopened before further use.
    async fn commit(&mut self) -> Result<(), SinkError>;

    /// Release the connection. Never fails and may be called repeatedly.
    async fn close(&mut self);

    /// Short name for logs.
    fn name(&self) -> &str;
}
