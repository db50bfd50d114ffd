//! Settings sections.
//!
//! Every section is `#[serde(default)]` so a partial JSON file only needs
//! the keys it overrides.

use std::time::Duration;

use ecu_core::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_CRITICAL_CEILING,
    DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_HEARTBEAT_LOG_INTERVAL_SECS, DEFAULT_HEARTBEAT_SWEEP_SECS,
    DEFAULT_HEARTBEAT_TIMEOUT_SECS, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_MESSAGE_BYTES,
    DEFAULT_WS_PATH, DEFAULT_WS_PORT,
};
use ecu_core::RetryConfig;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Southbound listener.
    pub server: ServerSettings,
    /// Liveness detection.
    pub heartbeat: HeartbeatSettings,
    /// Command dispatch.
    pub dispatcher: DispatcherSettings,
    /// Action log pipeline.
    pub pipeline: PipelineSettings,
    /// Persistence.
    pub database: DatabaseSettings,
    /// Diagnostic logging.
    pub logging: LoggingSettings,
    /// Simulated devices started with `--simulate`.
    pub simulator: SimulatorSettings,
}

impl GatewaySettings {
    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.sweep_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "heartbeat.sweepIntervalSecs must be positive".into(),
            ));
        }
        if self.heartbeat.sweep_interval_secs > self.heartbeat.timeout_secs {
            return Err(SettingsError::InvalidValue(format!(
                "heartbeat.sweepIntervalSecs ({}) exceeds heartbeat.timeoutSecs ({})",
                self.heartbeat.sweep_interval_secs, self.heartbeat.timeout_secs
            )));
        }
        if self.pipeline.batch_size == 0 {
            return Err(SettingsError::InvalidValue(
                "pipeline.batchSize must be positive".into(),
            ));
        }
        if self.pipeline.flush_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "pipeline.flushIntervalMs must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.simulator.failure_rate)
            || !(0.0..=1.0).contains(&self.simulator.drop_rate)
        {
            return Err(SettingsError::InvalidValue(
                "simulator rates must be within 0.0..=1.0".into(),
            ));
        }
        if !self.server.ws_path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server.wsPath must start with '/': {}",
                self.server.ws_path
            )));
        }
        Ok(())
    }
}

/// Southbound network settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// WebSocket path devices connect to.
    pub ws_path: String,
    /// Maximum concurrent device connections.
    pub max_connections: usize,
    /// Maximum inbound frame size in bytes.
    pub max_message_bytes: usize,
    /// Seconds a new socket has to send its handshake frame.
    pub handshake_timeout_secs: u64,
    /// Grace period for in-flight work at shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_WS_PORT,
            ws_path: DEFAULT_WS_PATH.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            handshake_timeout_secs: 10,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Heartbeat monitor settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Staleness threshold `T` in seconds.
    pub timeout_secs: u64,
    /// Sweep period in seconds.
    pub sweep_interval_secs: u64,
    /// Minimum spacing between persisted heartbeat entries per session.
    pub log_interval_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_HEARTBEAT_SWEEP_SECS,
            log_interval_secs: DEFAULT_HEARTBEAT_LOG_INTERVAL_SECS,
        }
    }
}

impl HeartbeatSettings {
    /// Staleness threshold.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Sweep period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Heartbeat log throttle.
    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.log_interval_secs)
    }
}

/// Command dispatcher settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatcherSettings {
    /// Timeout applied when a caller does not pass one.
    pub default_timeout_ms: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
        }
    }
}

impl DispatcherSettings {
    /// Default command timeout.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Action log pipeline settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    /// Entries per sink write.
    pub batch_size: usize,
    /// Periodic flush interval in milliseconds.
    pub flush_interval_ms: u64,
    /// Retry policy for failed sink writes.
    pub retry: RetryConfig,
    /// Held critical entries at which escalation sheds the oldest.
    pub critical_ceiling: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            retry: RetryConfig::default(),
            critical_ceiling: DEFAULT_CRITICAL_CEILING,
        }
    }
}

/// `SQLite` settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// Database file path; `:memory:` keeps everything in process.
    pub path: String,
    /// Connection pool size.
    pub pool_size: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "ecu-gateway.db".to_string(),
            pool_size: 4,
        }
    }
}

/// Diagnostic logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Device simulator settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulatorSettings {
    /// Heartbeat period of each simulated device, in milliseconds.
    pub message_interval_ms: u64,
    /// Maximum random deviation added to each period, in milliseconds.
    pub jitter_ms: u64,
    /// Probability a command is answered with an error object.
    pub failure_rate: f64,
    /// Probability a command is ignored entirely.
    pub drop_rate: f64,
    /// Delay before a simulated device answers, in milliseconds.
    pub response_delay_ms: u64,
    /// RNG seed; unset means seeded from entropy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            message_interval_ms: 30_000,
            jitter_ms: 2_000,
            failure_rate: 0.0,
            drop_rate: 0.0,
            response_delay_ms: 50,
            seed: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_match_gateway_constants() {
        let s = GatewaySettings::default();
        assert_eq!(s.server.port, 8081);
        assert_eq!(s.server.ws_path, "/ws/ecu");
        assert_eq!(s.heartbeat.timeout(), Duration::from_secs(90));
        assert_eq!(s.heartbeat.sweep_interval(), Duration::from_secs(30));
        assert_eq!(s.dispatcher.default_timeout(), Duration::from_secs(30));
        assert_eq!(s.pipeline.batch_size, 100);
        assert_eq!(s.pipeline.flush_interval_ms, 5000);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let s: GatewaySettings =
            serde_json::from_str(r#"{"heartbeat": {"timeoutSecs": 120}}"#).unwrap();
        assert_eq!(s.heartbeat.timeout_secs, 120);
        assert_eq!(s.heartbeat.sweep_interval_secs, 30);
        assert_eq!(s.server.port, 8081);
    }

    #[test]
    fn sweep_longer_than_timeout_is_rejected() {
        let mut s = GatewaySettings::default();
        s.heartbeat.sweep_interval_secs = 200;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(msg)) if msg.contains("sweepIntervalSecs"));
    }

    #[test]
    fn zero_batch_is_rejected() {
        let mut s = GatewaySettings::default();
        s.pipeline.batch_size = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn out_of_range_rates_are_rejected() {
        let mut s = GatewaySettings::default();
        s.simulator.failure_rate = 1.5;
        assert!(s.validate().is_err());
    }

    #[test]
    fn ws_path_must_be_absolute() {
        let mut s = GatewaySettings::default();
        s.server.ws_path = "ws/ecu".into();
        assert!(s.validate().is_err());
    }
}
