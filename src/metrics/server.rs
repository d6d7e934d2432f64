use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::metrics::Metrics;

/// `/status` reports process liveness only; it does not look at the broker.
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

pub async fn start_server(
    metrics: Arc<Metrics>,
    port: u16,
    shutdown: Arc<Notify>,
) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await?;

    info!("Stopped serving new connections");
    Ok(())
}

async fn status_handler() -> impl IntoResponse {
    (StatusCode::OK, "Success")
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();
    let mut buffer = vec![];

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}
