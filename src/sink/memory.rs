//! In-memory connector with fault injection.
//!
//! [`MemorySink`] is the shared "database": tests keep a handle to it to flip
//! reachability, reject rows or fail commits, and to inspect what was
//! committed. [`MemoryConnector`] is the session side handed to the
//! reconciler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::IntoError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{SessionState, SinkConnector};
use crate::error::{
    CommitSnafu, ConnectionLostSnafu, InsertSnafu, NotOpenSnafu, SinkCause, SinkError,
    SinkUnavailableSnafu,
};
use crate::fix::Fix;

#[derive(Debug)]
struct SinkState {
    reachable: bool,
    committed: Vec<Fix>,
    rejected: HashSet<DateTime<Utc>>,
    failing_commits: usize,
    ensure_opens: usize,
    opens: usize,
    commits: usize,
}

impl Default for SinkState {
    fn default() -> Self {
        Self {
            reachable: true,
            committed: Vec::new(),
            rejected: HashSet::new(),
            failing_commits: 0,
            ensure_opens: 0,
            opens: 0,
            commits: 0,
        }
    }
}

/// Shared handle to the in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<SinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new connector session against this store.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            sink: self.clone(),
            session: None,
        }
    }

    /// Make the store reachable or not. Going unreachable breaks every open
    /// session.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Reject any row with this timestamp, as a constraint violation would.
    pub fn reject_timestamp(&self, timestamp: DateTime<Utc>) {
        self.lock().rejected.insert(timestamp);
    }

    pub fn accept_timestamp(&self, timestamp: DateTime<Utc>) {
        self.lock().rejected.remove(&timestamp);
    }

    /// Fail the next `count` commits.
    pub fn fail_next_commits(&self, count: usize) {
        self.lock().failing_commits = count;
    }

    /// Rows committed so far, in commit order.
    pub fn committed(&self) -> Vec<Fix> {
        self.lock().committed.clone()
    }

    /// Number of `ensure_open` calls, successful or not.
    pub fn ensure_open_count(&self) -> usize {
        self.lock().ensure_opens
    }

    /// Number of successful open attempts.
    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug)]
struct Session {
    pending: Vec<Fix>,
    broken: bool,
}

/// Session on a [`MemorySink`].
#[derive(Debug)]
pub struct MemoryConnector {
    sink: MemorySink,
    session: Option<Session>,
}

impl MemoryConnector {
    /// True if a session is currently open and not known to be broken.
    pub fn is_open(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.broken)
    }

    fn unreachable() -> SinkCause {
        SinkCause::from("sink unreachable")
    }

    fn live_session(&mut self) -> Result<&mut Session, SinkError> {
        let reachable = self.sink.lock().reachable;
        let session = self.session.as_mut().ok_or_else(|| NotOpenSnafu.build())?;
        if session.broken {
            return Err(NotOpenSnafu.build());
        }
        if !reachable {
            session.broken = true;
            return Err(ConnectionLostSnafu.into_error(Self::unreachable()));
        }
        Ok(session)
    }
}

#[async_trait]
impl SinkConnector for MemoryConnector {
    async fn ensure_open(&mut self) -> Result<SessionState, SinkError> {
        let mut state = self.sink.lock();
        state.ensure_opens += 1;

        if let Some(session) = self.session.as_mut() {
            session.pending.clear();
            if !session.broken && state.reachable {
                return Ok(SessionState::Reused);
            }
        }
        self.session = None;

        if !state.reachable {
            return Err(SinkUnavailableSnafu.into_error(Self::unreachable()));
        }
        state.opens += 1;
        self.session = Some(Session {
            pending: Vec::new(),
            broken: false,
        });
        Ok(SessionState::Opened)
    }

    async fn insert(&mut self, fix: &Fix) -> Result<(), SinkError> {
        let rejected = self.sink.lock().rejected.contains(&fix.timestamp);
        let session = self.live_session()?;
        if rejected {
            return Err(InsertSnafu {
                row: fix.to_string(),
            }
            .into_error(SinkCause::from("row rejected by constraint")));
        }
        session.pending.push(*fix);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), SinkError> {
        let sink = self.sink.clone();
        let session = self.live_session()?;
        let mut state = sink.lock();

        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            session.broken = true;
            session.pending.clear();
            return Err(CommitSnafu.into_error(SinkCause::from("commit aborted")));
        }

        state.committed.append(&mut session.pending);
        state.commits += 1;
        Ok(())
    }

    async fn close(&mut self) {
        self.session = None;
    }

    fn name(&self) -> &str {
        "memory"
    }
}
