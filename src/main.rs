//! gnss-logger: logs NMEA GNSS fixes into PostgreSQL, buffering them on
//! disk while the database is unreachable.

use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gnss_logger::config::Config;
use gnss_logger::error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu, PipelineError};
use gnss_logger::{metrics, run_logger, signal};

/// NMEA GNSS logger with durable buffering.
#[derive(Parser, Debug)]
#[command(name = "gnss-logger")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Validate the configuration and exit.
    #[arg(long)]
    dry_run: bool,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("gnss-logger starting");

    let config = Config::from_file(&args.config).context(ConfigSnafu)?;

    if args.dry_run {
        info!("Dry run mode - validating configuration");
        info!(
            "Source: {} at {} baud",
            config.source.device, config.source.baud_rate
        );
        info!(
            "Sink: {}:{}/{} table {} (tls: {:?})",
            config.sink.host,
            config.sink.port,
            config.sink.database,
            config.sink.table,
            config.sink.tls_mode
        );
        info!("Buffer: {}", config.buffer.path.display());
        info!(
            "Drain interval: {}s, speed policy: {:?}",
            config.reconciler.drain_interval_secs, config.reconciler.speed_policy
        );
        info!("Configuration is valid");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    signal::cancel_on_signal(shutdown.clone());

    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr, shutdown.clone())
            .await
            .context(MetricsSnafu)?;
    }

    let stats = run_logger(config, shutdown).await?;

    let r = &stats.reconciler;
    info!("Logger finished");
    info!("  Lines read: {}", stats.lines_read);
    info!("  Sentences dropped: {}", stats.sentences_dropped);
    info!("  Fixes received: {}", r.fixes_received);
    info!("  Inserted live: {}", r.fixes_inserted);
    info!("  Buffered: {}", r.fixes_buffered);
    info!("  Drained: {}", r.entries_drained);
    info!("  Lost: {}", r.fixes_lost);
    info!("  Reconnects: {}", r.reconnects);

    Ok(())
}
