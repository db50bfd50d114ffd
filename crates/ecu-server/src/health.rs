//! `/health` and `/` response bodies.

use std::time::Instant;

use ecu_runtime::SessionCounts;
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while serving, `"shutting_down"` once shutdown began.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Devices per connection status.
    pub devices: SessionCounts,
    /// Open device sockets.
    pub connections: usize,
    /// Commands awaiting a response.
    pub pending_commands: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    shutting_down: bool,
    devices: SessionCounts,
    connections: usize,
    pending_commands: usize,
) -> HealthResponse {
    HealthResponse {
        status: if shutting_down { "shutting_down" } else { "ok" },
        uptime_secs: start_time.elapsed().as_secs(),
        devices,
        connections,
        pending_commands,
    }
}

/// Service banner served at `/`.
#[derive(Debug, Clone, Serialize)]
pub struct Banner {
    /// Service name.
    pub service: &'static str,
    /// Crate version.
    pub version: &'static str,
    /// Path devices connect on.
    pub ws_path: String,
    /// Devices with a live session.
    pub connected_devices: usize,
}

/// Build the `/` banner.
pub fn banner(ws_path: &str, connected_devices: usize) -> Banner {
    Banner {
        service: "ecu-gateway",
        version: env!("CARGO_PKG_VERSION"),
        ws_path: ws_path.to_owned(),
        connected_devices,
    }
}
