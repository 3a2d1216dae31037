//! Shutdown signal handling.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for SIGINT, SIGTERM or SIGQUIT.
///
/// If the Unix handlers cannot be installed, falls back to Ctrl-C only.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let handlers = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    );
    let (Ok(mut sigint), Ok(mut sigterm), Ok(mut sigquit)) = handlers else {
        warn!("Could not install Unix signal handlers, listening for Ctrl-C only");
        return ctrl_c().await;
    };

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    info!(message = "Signal received.", signal = name);
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    ctrl_c().await
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(message = "Signal received.", signal = "ctrl-c"),
        Err(e) => {
            warn!("Ctrl-C handler unavailable, shutdown by signal disabled: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Cancel `token` once a shutdown signal arrives.
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });
}
