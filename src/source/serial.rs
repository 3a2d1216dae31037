//! Serial port line source.

use async_trait::async_trait;
use snafu::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

use crate::config::SourceConfig;
use crate::error::{OpenDeviceSnafu, ReadLineSnafu, SourceError};

use super::LineSource;

/// Reads newline-terminated sentences from a serial GNSS receiver.
///
/// Bytes that are not valid UTF-8 are replaced rather than rejected, since
/// receivers emit line noise on power-up.
pub struct SerialLineSource {
    device: String,
    reader: BufReader<SerialStream>,
    buf: Vec<u8>,
}

impl SerialLineSource {
    /// Open the configured device.
    pub fn open(config: &SourceConfig) -> Result<Self, SourceError> {
        let stream = tokio_serial::new(&config.device, config.baud_rate)
            .open_native_async()
            .context(OpenDeviceSnafu {
                device: config.device.clone(),
            })?;
        info!(
            "Opened serial device {} at {} baud",
            config.device, config.baud_rate
        );

        Ok(Self {
            device: config.device.clone(),
            reader: BufReader::new(stream),
            buf: Vec::with_capacity(128),
        })
    }
}

#[async_trait]
impl LineSource for SerialLineSource {
    async fn next_line(&mut self) -> Result<Option<String>, SourceError> {
        // Partial reads stay in `buf` if this future is dropped mid-line.
        let n = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .await
            .context(ReadLineSnafu {
                device: self.device.clone(),
            })?;

        if n == 0 && self.buf.is_empty() {
            return Ok(None);
        }

        let line = String::from_utf8_lossy(&self.buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.buf.clear();
        Ok(Some(line))
    }
}
