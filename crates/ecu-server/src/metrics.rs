//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::ServerError;

/// Install the global Prometheus recorder.
///
/// Returns the handle used to render `/metrics`. Call once at startup,
/// before anything records a metric.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ecu_ws_connections_total";
/// WebSocket disconnections (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ecu_ws_disconnections_total";
/// Open device sockets (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ecu_ws_connections_active";
/// Handshakes refused (counter, labels: reason).
pub const WS_HANDSHAKE_FAILURES_TOTAL: &str = "ecu_ws_handshake_failures_total";
/// Frames received from devices (counter).
pub const WS_FRAMES_RECEIVED_TOTAL: &str = "ecu_ws_frames_received_total";
/// Frames sent to devices (counter).
pub const WS_FRAMES_SENT_TOTAL: &str = "ecu_ws_frames_sent_total";
/// Connections refused at the connection limit (counter).
pub const WS_REJECTED_TOTAL: &str = "ecu_ws_rejected_total";
