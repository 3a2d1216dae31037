//! Run loop.
//!
//! A [`LineReader`] task feeds raw lines over a channel. The loop selects
//! on shutdown, the drain timer and the next line. Handlers run to
//! completion once selected, so shutdown is only observed between fixes and
//! drains, never in the middle of a buffer rewrite.

use chrono::Utc;
use snafu::prelude::*;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::DurableBuffer;
use crate::config::{Config, ReconcilerConfig};
use crate::emit;
use crate::error::{PipelineError, SourceSnafu};
use crate::metrics::events::{DropReason, FixReceived, SentenceDropped};
use crate::reconciler::{Reconciler, ReconcilerStats};
use crate::sink::{PostgresConnector, SinkConnector};
use crate::source::{FixAssembler, LineReader, LineSource, SerialLineSource};

/// Statistics about one logger run.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub lines_read: usize,
    pub sentences_dropped: usize,
    pub read_errors: usize,
    pub drain_cycles: usize,
    pub reconciler: ReconcilerStats,
}

/// The logger loop over one line source and one reconciler.
pub struct Pipeline<C> {
    reconciler: Reconciler<C>,
    assembler: FixAssembler,
    drain_interval: Duration,
    read_error_backoff: Duration,
    shutdown: CancellationToken,
    stats: PipelineStats,
}

impl<C: SinkConnector> Pipeline<C> {
    pub fn new(
        reconciler: Reconciler<C>,
        config: &ReconcilerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            reconciler,
            assembler: FixAssembler::new(),
            drain_interval: config.drain_interval(),
            read_error_backoff: config.read_error_backoff(),
            shutdown,
            stats: PipelineStats::default(),
        }
    }

    pub fn reconciler(&self) -> &Reconciler<C> {
        &self.reconciler
    }

    /// Run until shutdown or until the source is exhausted.
    ///
    /// A backlog left by a previous run is drained once before the first
    /// line is read, then again every drain interval.
    pub async fn run<S: LineSource + 'static>(&mut self, source: S) -> PipelineStats {
        info!(
            "Starting logger, draining every {}s",
            self.drain_interval.as_secs()
        );

        match self.reconciler.buffer().remove_stale_stages() {
            Ok(0) => {}
            Ok(removed) => info!("Removed {} stale buffer staging files", removed),
            Err(e) => warn!("Could not sweep stale buffer staging files: {}", e),
        }

        self.stats.drain_cycles += 1;
        let report = self.reconciler.run_periodic().await;
        debug!("Startup drain: {:?}", report);

        let shutdown = self.shutdown.clone();
        let mut reader = LineReader::spawn(source, shutdown.clone());
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.drain_interval, self.drain_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }

                _ = ticker.tick() => {
                    self.stats.drain_cycles += 1;
                    let report = self.reconciler.run_periodic().await;
                    debug!("Periodic drain: {:?}", report);
                }

                line = reader.rx.recv() => match line {
                    Some(Ok(line)) => self.handle_line(&line).await,
                    Some(Err(e)) => {
                        self.stats.read_errors += 1;
                        emit!(SentenceDropped { reason: DropReason::Read });
                        warn!(
                            "Read failed, retrying in {}s: {}",
                            self.read_error_backoff.as_secs(),
                            e
                        );
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = tokio::time::sleep(self.read_error_backoff) => {}
                        }
                    }
                    None => {
                        info!("Line source closed");
                        break;
                    }
                },
            }
        }

        reader.stop().await;
        self.reconciler.close().await;

        self.stats.reconciler = self.reconciler.stats().clone();
        info!("Logger stopped: {:?}", self.stats);
        self.stats.clone()
    }

    async fn handle_line(&mut self, line: &str) {
        self.stats.lines_read += 1;

        match self.assembler.accept(line, Utc::now()) {
            Ok(Some(fix)) => {
                emit!(FixReceived);
                self.reconciler.handle_fix(fix).await;
            }
            Ok(None) => {}
            Err(e) => {
                self.stats.sentences_dropped += 1;
                emit!(SentenceDropped {
                    reason: DropReason::Parse
                });
                warn!("Dropping sentence '{}': {}", line.trim(), e);
            }
        }
    }
}

/// Open the configured serial device and PostgreSQL sink and run until
/// `shutdown` is cancelled.
pub async fn run_logger(
    config: Config,
    shutdown: CancellationToken,
) -> Result<PipelineStats, PipelineError> {
    let source = SerialLineSource::open(&config.source).context(SourceSnafu)?;
    let connector = PostgresConnector::new(&config.sink);
    let buffer = DurableBuffer::new(&config.buffer.path);
    let reconciler = Reconciler::new(connector, buffer, config.reconciler.speed_policy);

    let mut pipeline = Pipeline::new(reconciler, &config.reconciler, shutdown);
    Ok(pipeline.run(source).await)
}
