//! Prometheus exporter

use std::net::SocketAddr;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder};

use crate::{ControlError, Result};

lazy_static! {
    /// Failed POSTs to the actuator sink.
    pub static ref SINK_ERRORS: IntCounter = register_int_counter!(
        "kaleidoscope_sink_errors_total",
        "failed pushes to the actuator sink"
    )
    .unwrap();

    /// Frames waiting in the sink queue.
    pub static ref SINK_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "kaleidoscope_sink_queue_depth",
        "output frames waiting for the actuator sink"
    )
    .unwrap();
}

/// Render the default registry in the Prometheus text format.
pub fn render() -> Result<String> {
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&families, &mut buffer)
        .map_err(|e| ControlError::HttpError(format!("metrics encoding failed: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| ControlError::HttpError(format!("metrics encoding failed: {}", e)))
}

async fn get_metrics() -> std::result::Result<String, axum::http::StatusCode> {
    render().map_err(|e| {
        tracing::error!("unable to render metrics: {}", e);
        axum::http::StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Serve `GET /metrics` on its own listener.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let app = Router::new().route("/metrics", get(get_metrics));

    tracing::info!("metrics exporter listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControlError::HttpError(format!("failed to bind metrics listener: {}", e)))?;
    axum::serve(listener, app.into_make_service())
        .await
        .map_err(|e| ControlError::HttpError(format!("metrics server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_metrics() {
        SINK_ERRORS.inc_by(0);
        let text = render().unwrap();
        assert!(text.contains("kaleidoscope_sink_errors_total"));
    }
}
