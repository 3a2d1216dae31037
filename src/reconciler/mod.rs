//! Live insert, buffering and drain policy.
//!
//! The reconciler owns both the sink connector and the durable buffer, so
//! every sink and buffer operation is serialized through `&mut self`. It
//! never returns an error: each failure is mapped to one of the outcomes
//! below, logged, and counted.
//!
//! A fix is removed from the buffer only after a drain has inserted *and*
//! committed it. If a commit fails, the whole drain is considered not
//! durable and every entry stays buffered for the next cycle.

use tracing::{debug, error, info, warn};

use crate::buffer::{BufferEntry, DurableBuffer};
use crate::config::SpeedPolicy;
use crate::emit;
use crate::error::SinkError;
use crate::fix::Fix;
use crate::metrics::events::{
    BacklogSize, CommitFailed, EntriesDrained, FixBuffered, FixInserted, FixLost, SinkReconnected,
};
use crate::sink::{SessionState, SinkConnector};

/// What happened to one incoming fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixOutcome {
    /// Committed to the sink.
    Inserted,
    /// The sink failed; the fix is in the durable buffer.
    Buffered,
    /// Neither the sink nor the buffer accepted the fix.
    Lost,
}

/// Result of one drain attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReport {
    /// Nothing was buffered; the sink was not touched.
    Empty,
    /// The sink could not be opened; the backlog is untouched.
    Deferred { backlog: usize },
    /// `drained` entries were committed and removed, `retained` remain.
    Completed { drained: usize, retained: usize },
    /// Commit failed; all `retained` entries remain buffered.
    CommitFailed { retained: usize },
    /// Entries were committed but the buffer could not be rewritten, so they
    /// are still buffered and will be inserted again.
    RewriteFailed { drained: usize },
    /// The buffer file could not be read.
    BufferUnreadable,
}

/// Whether a drain must probe the session before inserting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionCheck {
    Required,
    /// The caller opened or probed the session just before.
    Done,
}

/// Counters for one reconciler lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub fixes_received: usize,
    pub fixes_inserted: usize,
    pub fixes_buffered: usize,
    pub fixes_lost: usize,
    pub entries_drained: usize,
    pub reconnects: usize,
    pub commit_failures: usize,
}

/// Routes fixes to the sink or the buffer and drains the buffer.
pub struct Reconciler<C> {
    connector: C,
    buffer: DurableBuffer,
    speed_policy: SpeedPolicy,
    last_speed: Option<f64>,
    connected_once: bool,
    stats: ReconcilerStats,
}

impl<C: SinkConnector> Reconciler<C> {
    pub fn new(connector: C, buffer: DurableBuffer, speed_policy: SpeedPolicy) -> Self {
        Self {
            connector,
            buffer,
            speed_policy,
            last_speed: None,
            connected_once: false,
            stats: ReconcilerStats::default(),
        }
    }

    pub fn stats(&self) -> &ReconcilerStats {
        &self.stats
    }

    pub fn buffer(&self) -> &DurableBuffer {
        &self.buffer
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Deliver one fix live, falling back to the buffer.
    ///
    /// A successful live insert is followed by a drain, so the backlog
    /// empties as soon as the sink is back.
    pub async fn handle_fix(&mut self, fix: Fix) -> FixOutcome {
        self.stats.fixes_received += 1;
        let fix = self.apply_speed_policy(fix);

        match self.deliver(&fix).await {
            Ok(()) => {
                self.stats.fixes_inserted += 1;
                emit!(FixInserted);
                debug!("Inserted fix {}", fix);
                self.drain_backlog(SessionCheck::Done).await;
                FixOutcome::Inserted
            }
            Err(e) => {
                warn!("Live insert failed, buffering fix: {}", e);
                self.buffer_fix(&fix)
            }
        }
    }

    /// Move buffered entries into the sink.
    pub async fn drain(&mut self) -> DrainReport {
        self.drain_backlog(SessionCheck::Required).await
    }

    /// Timer-driven maintenance: check the session, then drain.
    pub async fn run_periodic(&mut self) -> DrainReport {
        if let Err(e) = self.open_session().await {
            warn!("Sink health check failed: {}", e);
            return match self.buffer.len() {
                Ok(0) => DrainReport::Empty,
                Ok(backlog) => {
                    emit!(BacklogSize { entries: backlog });
                    DrainReport::Deferred { backlog }
                }
                Err(e) => {
                    error!("Cannot read buffer: {}", e);
                    DrainReport::BufferUnreadable
                }
            };
        }
        self.drain_backlog(SessionCheck::Done).await
    }

    /// Release the sink connection.
    pub async fn close(&mut self) {
        self.connector.close().await;
    }

    async fn drain_backlog(&mut self, check: SessionCheck) -> DrainReport {
        let entries = match self.buffer.read_all() {
            Ok(entries) => entries,
            Err(e) => {
                error!("Cannot read buffer, skipping drain: {}", e);
                return DrainReport::BufferUnreadable;
            }
        };
        if entries.is_empty() {
            return DrainReport::Empty;
        }

        let total = entries.len();
        if check == SessionCheck::Required
            && let Err(e) = self.open_session().await
        {
            info!("Sink unavailable, {} entries stay buffered: {}", total, e);
            emit!(BacklogSize { entries: total });
            return DrainReport::Deferred { backlog: total };
        }

        info!("Draining {} buffered entries", total);
        let (inserted, retained) = self.insert_entries(entries).await;

        if inserted == 0 {
            emit!(BacklogSize { entries: total });
            return DrainReport::Completed {
                drained: 0,
                retained: total,
            };
        }

        if let Err(e) = self.connector.commit().await {
            self.record_commit_failure(&e);
            warn!(
                "Drain not durable, keeping all {} entries for the next cycle",
                total
            );
            if let Err(e) = self.open_session().await {
                warn!("Reconnect after failed commit did not succeed: {}", e);
            }
            emit!(BacklogSize { entries: total });
            return DrainReport::CommitFailed { retained: total };
        }

        if let Err(e) = self.buffer.replace_with(&retained) {
            error!(
                "Committed {} entries but could not rewrite the buffer; they will be inserted again: {}",
                inserted, e
            );
            return DrainReport::RewriteFailed { drained: inserted };
        }

        self.stats.entries_drained += inserted;
        emit!(EntriesDrained {
            count: inserted as u64
        });
        emit!(BacklogSize {
            entries: retained.len()
        });
        info!(
            "Drained {} entries, {} retained",
            inserted,
            retained.len()
        );
        DrainReport::Completed {
            drained: inserted,
            retained: retained.len(),
        }
    }

    fn apply_speed_policy(&mut self, fix: Fix) -> Fix {
        if fix.speed.is_some() {
            self.last_speed = fix.speed;
            return fix;
        }
        match self.speed_policy {
            SpeedPolicy::Absent => fix,
            SpeedPolicy::Zero => fix.with_speed(Some(0.0)),
            SpeedPolicy::LastKnown => fix.with_speed(self.last_speed),
        }
    }

    async fn deliver(&mut self, fix: &Fix) -> Result<(), SinkError> {
        self.open_session().await?;
        self.connector.insert(fix).await?;
        if let Err(e) = self.connector.commit().await {
            self.record_commit_failure(&e);
            return Err(e);
        }
        Ok(())
    }

    /// Insert every parseable entry. Returns the number inserted and the
    /// entries to keep, in their original order.
    async fn insert_entries(&mut self, entries: Vec<BufferEntry>) -> (usize, Vec<BufferEntry>) {
        let mut inserted = 0;
        let mut retained = Vec::new();
        let mut pending = entries.into_iter();

        while let Some(entry) = pending.next() {
            let fix = match entry.to_fix() {
                Ok(fix) => fix,
                Err(e) => {
                    warn!("Keeping unparseable buffer entry '{}': {}", entry, e);
                    retained.push(entry);
                    continue;
                }
            };

            match self.connector.insert(&fix).await {
                Ok(()) => inserted += 1,
                Err(e) if e.is_connection_fault() => {
                    warn!("Connection lost mid-drain, keeping remaining entries: {}", e);
                    retained.push(entry);
                    retained.extend(pending.by_ref());
                    break;
                }
                Err(e) => {
                    warn!("Keeping rejected buffer entry: {}", e);
                    retained.push(entry);
                }
            }
        }

        (inserted, retained)
    }

    fn buffer_fix(&mut self, fix: &Fix) -> FixOutcome {
        match self.buffer.append(fix) {
            Ok(()) => {
                self.stats.fixes_buffered += 1;
                emit!(FixBuffered);
                info!("Buffered fix {} to {}", fix, self.buffer.path().display());
                match self.buffer.len() {
                    Ok(entries) => emit!(BacklogSize { entries }),
                    Err(e) => debug!("Cannot size buffer after append: {}", e),
                }
                FixOutcome::Buffered
            }
            Err(e) => {
                error!("Durability violation, fix {} lost: {}", fix, e);
                self.stats.fixes_lost += 1;
                emit!(FixLost);
                FixOutcome::Lost
            }
        }
    }

    async fn open_session(&mut self) -> Result<(), SinkError> {
        if self.connector.ensure_open().await? == SessionState::Opened {
            if self.connected_once {
                self.stats.reconnects += 1;
                emit!(SinkReconnected);
                info!("Reconnected to {}", self.connector.name());
            } else {
                info!("Connected to {}", self.connector.name());
            }
            self.connected_once = true;
        }
        Ok(())
    }

    fn record_commit_failure(&mut self, e: &SinkError) {
        self.stats.commit_failures += 1;
        emit!(CommitFailed);
        warn!("Commit to {} failed: {}", self.connector.name(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemoryConnector, MemorySink};
    use chrono::{TimeZone, Utc};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tempfile::TempDir;

    fn fix(second: u32, speed: Option<f64>) -> Fix {
        Fix {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, second).unwrap(),
            latitude: Some(52.5),
            longitude: Some(13.4),
            altitude: Some(34.0),
            speed,
        }
    }

    fn reconciler(
        dir: &TempDir,
        policy: SpeedPolicy,
    ) -> (MemorySink, Reconciler<MemoryConnector>) {
        let sink = MemorySink::new();
        let buffer = DurableBuffer::new(dir.path().join("buffer.csv"));
        let reconciler = Reconciler::new(sink.connector(), buffer, policy);
        (sink, reconciler)
    }

    #[tokio::test]
    async fn test_speed_policy_zero() {
        let dir = TempDir::new().unwrap();
        let (sink, mut reconciler) = reconciler(&dir, SpeedPolicy::Zero);

        reconciler.handle_fix(fix(0, None)).await;
        assert_eq!(sink.committed()[0].speed, Some(0.0));
    }

    #[tokio::test]
    async fn test_speed_policy_absent() {
        let dir = TempDir::new().unwrap();
        let (sink, mut reconciler) = reconciler(&dir, SpeedPolicy::Absent);

        reconciler.handle_fix(fix(0, None)).await;
        assert_eq!(sink.committed()[0].speed, None);
    }

    #[tokio::test]
    async fn test_speed_policy_last_known() {
        let dir = TempDir::new().unwrap();
        let (sink, mut reconciler) = reconciler(&dir, SpeedPolicy::LastKnown);

        reconciler.handle_fix(fix(0, None)).await;
        reconciler.handle_fix(fix(1, Some(7.5))).await;
        reconciler.handle_fix(fix(2, None)).await;

        let speeds: Vec<_> = sink.committed().iter().map(|f| f.speed).collect();
        assert_eq!(speeds, vec![None, Some(7.5), Some(7.5)]);
    }

    #[tokio::test]
    async fn test_unreachable_sink_buffers() {
        let dir = TempDir::new().unwrap();
        let (sink, mut reconciler) = reconciler(&dir, SpeedPolicy::Zero);
        sink.set_reachable(false);

        assert_eq!(
            reconciler.handle_fix(fix(0, Some(1.0))).await,
            FixOutcome::Buffered
        );
        assert_eq!(reconciler.buffer().len().unwrap(), 1);
        assert_eq!(reconciler.stats().fixes_buffered, 1);
        assert_eq!(sink.open_count(), 0);
    }

    #[tokio::test]
    async fn test_buffer_failure_counts_lost_fix() {
        let dir = TempDir::new().unwrap();
        let sink = MemorySink::new();
        sink.set_reachable(false);
        let buffer = DurableBuffer::new(dir.path().join("missing").join("buffer.csv"));
        let mut reconciler = Reconciler::new(sink.connector(), buffer, SpeedPolicy::Zero);

        assert_eq!(
            reconciler.handle_fix(fix(0, Some(1.0))).await,
            FixOutcome::Lost
        );
        assert_eq!(reconciler.stats().fixes_lost, 1);
    }

    #[tokio::test]
    async fn test_live_commit_failure_buffers_fix() {
        let dir = TempDir::new().unwrap();
        let (sink, mut reconciler) = reconciler(&dir, SpeedPolicy::Zero);
        sink.fail_next_commits(1);

        assert_eq!(
            reconciler.handle_fix(fix(0, Some(1.0))).await,
            FixOutcome::Buffered
        );
        assert_eq!(reconciler.stats().commit_failures, 1);
        assert!(sink.committed().is_empty());

        // The next fix reopens the session and drains the first one.
        assert_eq!(
            reconciler.handle_fix(fix(1, Some(1.0))).await,
            FixOutcome::Inserted
        );
        assert_eq!(sink.committed().len(), 2);
        assert!(reconciler.buffer().is_empty().unwrap());
        assert_eq!(reconciler.stats().reconnects, 1);
    }

    #[tokio::test]
    async fn test_connection_loss_mid_drain_keeps_rest() {
        struct DropAfter {
            inner: MemoryConnector,
            sink: MemorySink,
            inserts_left: usize,
        }

        #[async_trait::async_trait]
        impl SinkConnector for DropAfter {
            async fn ensure_open(&mut self) -> Result<SessionState, SinkError> {
                self.inner.ensure_open().await
            }

            async fn insert(&mut self, fix: &Fix) -> Result<(), SinkError> {
                if self.inserts_left == 0 {
                    self.sink.set_reachable(false);
                }
                self.inserts_left = self.inserts_left.saturating_sub(1);
                self.inner.insert(fix).await
            }

            async fn commit(&mut self) -> Result<(), SinkError> {
                self.sink.set_reachable(true);
                self.inner.commit().await
            }

            async fn close(&mut self) {
                self.inner.close().await
            }

            fn name(&self) -> &str {
                "drop-after"
            }
        }

        let dir = TempDir::new().unwrap();
        let mut buffer = DurableBuffer::new(dir.path().join("buffer.csv"));
        for s in 0..4 {
            buffer.append(&fix(s, Some(1.0))).unwrap();
        }
        let sink = MemorySink::new();
        let connector = DropAfter {
            inner: sink.connector(),
            sink: sink.clone(),
            inserts_left: 2,
        };
        let mut reconciler = Reconciler::new(connector, buffer, SpeedPolicy::Zero);

        // The lost connection also breaks the commit, so nothing is removed.
        assert_eq!(
            reconciler.drain().await,
            DrainReport::CommitFailed { retained: 4 }
        );
        assert_eq!(reconciler.buffer().len().unwrap(), 4);
        assert!(sink.committed().is_empty());
    }

    #[tokio::test]
    async fn test_run_periodic_defers_while_unreachable() {
        let dir = TempDir::new().unwrap();
        let (sink, mut reconciler) = reconciler(&dir, SpeedPolicy::Zero);
        sink.set_reachable(false);
        reconciler.handle_fix(fix(0, Some(1.0))).await;

        assert_eq!(
            reconciler.run_periodic().await,
            DrainReport::Deferred { backlog: 1 }
        );

        sink.set_reachable(true);
        assert_eq!(
            reconciler.run_periodic().await,
            DrainReport::Completed {
                drained: 1,
                retained: 0
            }
        );
        assert_eq!(reconciler.stats().entries_drained, 1);
        // First open is a connect, not a reconnect.
        assert_eq!(reconciler.stats().reconnects, 0);
    }

    #[tokio::test]
    async fn test_run_periodic_checks_session_once() {
        let dir = TempDir::new().unwrap();
        let (sink, mut reconciler) = reconciler(&dir, SpeedPolicy::Zero);
        sink.set_reachable(false);
        reconciler.handle_fix(fix(0, Some(1.0))).await;
        sink.set_reachable(true);
        let before = sink.ensure_open_count();

        assert_eq!(
            reconciler.run_periodic().await,
            DrainReport::Completed {
                drained: 1,
                retained: 0
            }
        );
        assert_eq!(sink.ensure_open_count() - before, 1);

        // A live insert checks the session once and drains on it.
        let before = sink.ensure_open_count();
        reconciler.handle_fix(fix(1, Some(1.0))).await;
        assert_eq!(sink.ensure_open_count() - before, 1);
    }

    #[test]
    fn test_buffered_fix_updates_backlog_gauge() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let dir = TempDir::new().unwrap();

        metrics::with_local_recorder(&recorder, || {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
                .block_on(async {
                    let (sink, mut reconciler) = reconciler(&dir, SpeedPolicy::Zero);
                    sink.set_reachable(false);
                    reconciler.handle_fix(fix(0, Some(1.0))).await;
                    reconciler.handle_fix(fix(1, Some(1.0))).await;
                })
        });

        let rendered = handle.render();
        assert!(rendered.contains("gnss_backlog_entries 2"), "{rendered}");
    }

    #[tokio::test]
    async fn test_run_periodic_with_empty_buffer() {
        let dir = TempDir::new().unwrap();
        let (sink, mut reconciler) = reconciler(&dir, SpeedPolicy::Zero);

        assert_eq!(reconciler.run_periodic().await, DrainReport::Empty);
        assert_eq!(sink.open_count(), 1);
        assert_eq!(sink.commit_count(), 0);
    }
}
