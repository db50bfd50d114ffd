//! Defaults shared by settings, runtime and persistence.

/// Maximum length of an `ecu_id` (width of the `ecu_id` column).
pub const MAX_ECU_ID_LEN: usize = 100;

/// Value written to `ecu_admin_logs.admin_user` for gateway-originated entries.
pub const SYSTEM_ADMIN_USER: &str = "system";

/// Heartbeat staleness threshold `T` in seconds.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 90;

/// Heartbeat sweep interval in seconds (`T / 3`).
pub const DEFAULT_HEARTBEAT_SWEEP_SECS: u64 = 30;

/// Minimum spacing between persisted `heartbeat` entries per session.
pub const DEFAULT_HEARTBEAT_LOG_INTERVAL_SECS: u64 = 300;

/// Default command timeout in milliseconds.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

/// Default pipeline batch size.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default pipeline flush interval in milliseconds.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;

/// Held critical entries at which escalation gives up and sheds the oldest.
pub const DEFAULT_CRITICAL_CEILING: usize = 10_000;

/// Default WebSocket path devices connect to.
pub const DEFAULT_WS_PATH: &str = "/ws/ecu";

/// Default southbound listen port.
pub const DEFAULT_WS_PORT: u16 = 8081;

/// Upper bound on a single inbound device frame in bytes.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Default maximum concurrent device connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;
