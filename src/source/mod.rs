//! Fix source: raw NMEA lines in, fixes out.
//!
//! The [`LineSource`] trait is the boundary to the device. [`LineReader`] runs
//! a source on its own task so the pipeline can select on lines, the drain
//! timer and shutdown at the same time. [`FixAssembler`] turns lines into
//! fixes, carrying the last RMC speed over to the next GGA position.

pub mod nmea;
pub mod serial;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{ParseError, SourceError};
use crate::fix::Fix;

pub use nmea::{Sentence, parse_sentence};
pub use serial::SerialLineSource;

/// Capacity of the line channel between the reader task and the pipeline.
const LINE_CHANNEL_CAPACITY: usize = 64;

/// Something that yields raw text lines, one at a time.
#[async_trait]
pub trait LineSource: Send {
    /// Next line without its terminator, or `None` once the source is exhausted.
    async fn next_line(&mut self) -> Result<Option<String>, SourceError>;
}

/// Background task forwarding lines from a [`LineSource`].
pub struct LineReader {
    pub rx: mpsc::Receiver<Result<String, SourceError>>,
    handle: JoinHandle<()>,
}

impl LineReader {
    /// Spawn the reader task. The channel closes when the source is exhausted
    /// or shutdown is requested.
    pub fn spawn<S: LineSource + 'static>(mut source: S, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);

        let handle = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    next = source.next_line() => next,
                };

                let item = match next {
                    Ok(Some(line)) => Ok(line),
                    Ok(None) => {
                        debug!("Line source exhausted");
                        break;
                    }
                    Err(e) => Err(e),
                };

                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        Self { rx, handle }
    }

    /// Stop the reader task, releasing the device.
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

/// Stateful NMEA decoder producing one fix per GGA sentence.
#[derive(Debug, Default)]
pub struct FixAssembler {
    last_speed: Option<f64>,
}

impl FixAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Speed from the most recent RMC sentence, in km/h.
    pub fn last_speed(&self) -> Option<f64> {
        self.last_speed
    }

    /// Feed one line received at `received_at`.
    ///
    /// Returns `Ok(Some(fix))` for a GGA sentence, `Ok(None)` for blank lines,
    /// RMC updates and sentences the logger does not use.
    pub fn accept(
        &mut self,
        line: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Option<Fix>, ParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        trace!("Received: {}", line);

        match parse_sentence(line)? {
            Sentence::Speed(Some(speed)) => {
                self.last_speed = Some(speed);
                debug!("Speed updated: {:.2} km/h", speed);
                Ok(None)
            }
            Sentence::Speed(None) | Sentence::Other => Ok(None),
            Sentence::Position {
                latitude,
                longitude,
                altitude,
            } => Ok(Some(Fix {
                timestamp: received_at,
                latitude,
                longitude,
                altitude,
                speed: self.last_speed,
            })),
        }
    }
}
