//! Internal events for metrics emission.
//!
//! Each event struct is one measurable occurrence in the logger. Emitting
//! it records the matching counter or gauge; the recorder is a no-op unless
//! the Prometheus exporter was installed.

use metrics::{counter, gauge};
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// A GGA sentence produced a fix.
pub struct FixReceived;

impl InternalEvent for FixReceived {
    fn emit(self) {
        counter!("gnss_fixes_received_total").increment(1);
    }
}

/// Why an input line was dropped.
#[derive(Debug, Clone, Copy)]
pub enum DropReason {
    Parse,
    Read,
}

impl DropReason {
    fn as_str(&self) -> &'static str {
        match self {
            DropReason::Parse => "parse",
            DropReason::Read => "read",
        }
    }
}

/// An input line was discarded without producing a fix.
pub struct SentenceDropped {
    pub reason: DropReason,
}

impl InternalEvent for SentenceDropped {
    fn emit(self) {
        trace!(reason = self.reason.as_str(), "Sentence dropped");
        counter!("gnss_sentences_dropped_total", "reason" => self.reason.as_str()).increment(1);
    }
}

/// A live fix was committed to the sink.
pub struct FixInserted;

impl InternalEvent for FixInserted {
    fn emit(self) {
        counter!("gnss_fixes_inserted_total").increment(1);
    }
}

/// A fix was written to the durable buffer.
pub struct FixBuffered;

impl InternalEvent for FixBuffered {
    fn emit(self) {
        counter!("gnss_fixes_buffered_total").increment(1);
    }
}

/// A fix could be neither delivered nor buffered.
pub struct FixLost;

impl InternalEvent for FixLost {
    fn emit(self) {
        counter!("gnss_fixes_lost_total").increment(1);
    }
}

/// Buffered entries were committed to the sink by a drain.
pub struct EntriesDrained {
    pub count: u64,
}

impl InternalEvent for EntriesDrained {
    fn emit(self) {
        trace!(count = self.count, "Entries drained");
        counter!("gnss_entries_drained_total").increment(self.count);
    }
}

/// Current number of entries in the durable buffer.
pub struct BacklogSize {
    pub entries: usize,
}

impl InternalEvent for BacklogSize {
    fn emit(self) {
        gauge!("gnss_backlog_entries").set(self.entries as f64);
    }
}

/// The sink session had to be reopened.
pub struct SinkReconnected;

impl InternalEvent for SinkReconnected {
    fn emit(self) {
        counter!("gnss_sink_reconnects_total").increment(1);
    }
}

/// A commit to the sink failed.
pub struct CommitFailed;

impl InternalEvent for CommitFailed {
    fn emit(self) {
        counter!("gnss_commit_failures_total").increment(1);
    }
}
