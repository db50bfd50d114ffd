//! Server configuration.

use std::time::Duration;

use ecu_core::constants::{DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_WS_PATH};
use ecu_settings::ServerSettings;

/// Configuration for the southbound server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` auto-assigns).
    pub port: u16,
    /// Path devices upgrade on.
    pub ws_path: String,
    /// Maximum concurrent device connections.
    pub max_connections: usize,
    /// Maximum inbound or outbound frame size in bytes.
    pub max_message_bytes: usize,
    /// Time a new socket has to send its handshake frame.
    pub handshake_timeout: Duration,
    /// Grace period for connection tasks at shutdown.
    pub shutdown_timeout: Duration,
    /// Outbound frames buffered per connection.
    pub send_queue: usize,
}

impl ServerConfig {
    /// Build from the `server` settings section.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            ws_path: settings.ws_path.clone(),
            max_connections: settings.max_connections,
            max_message_bytes: settings.max_message_bytes,
            handshake_timeout: Duration::from_secs(settings.handshake_timeout_secs),
            shutdown_timeout: Duration::from_secs(settings.shutdown_timeout_secs),
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ws_path: DEFAULT_WS_PATH.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            handshake_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            send_queue: 256,
        }
    }
}
