//! Prometheus exporter and health endpoint.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{BindSnafu, MetricsError, PrometheusInitSnafu};

/// Install the Prometheus recorder and serve `/metrics` and `/health` on
/// `addr` until `shutdown` is cancelled.
///
/// Binding happens before this returns, so an unusable address is reported
/// as a startup error rather than from the background task.
pub async fn init(addr: SocketAddr, shutdown: CancellationToken) -> Result<(), MetricsError> {
    let listener = TcpListener::bind(addr).await.context(BindSnafu { addr })?;
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    info!("Serving metrics on http://{}/metrics", addr);
    tokio::spawn(run_server(listener, handle, shutdown));
    Ok(())
}

async fn run_server(listener: TcpListener, handle: PrometheusHandle, shutdown: CancellationToken) {
    let app = router(handle);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = served {
        error!("Metrics server error: {}", e);
    }
}

fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle))
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> &'static str {
    "ok\n"
}
