//! Behaviour of a single simulated ECU.

use chrono::Utc;
use ecu_core::EcuId;
use ecu_rpc::{ErrorObject, methods};
use serde_json::{Value, json};
use tokio::time::Instant;

use crate::config::SimulatorConfig;

/// Firmware version reported by simulated devices.
pub const FIRMWARE_VERSION: &str = "1.0.0-sim";

/// What a device decided to do with a command.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// Answer with a result or an error.
    Answer(Result<Value, ErrorObject>),
    /// Ignore the command.
    Drop,
}

/// Fault draw for one command, made by the caller from the fleet RNG.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Faults {
    /// Ignore the command.
    pub drop: bool,
    /// Answer with a synthetic error.
    pub fail: bool,
}

/// Device-side state.
#[derive(Debug)]
pub struct SimulatedDevice {
    ecu_id: EcuId,
    booted: Instant,
    commands_handled: u64,
    heartbeats_sent: u64,
}

impl SimulatedDevice {
    /// Fresh device that booted now.
    pub fn new(ecu_id: EcuId) -> Self {
        Self {
            ecu_id,
            booted: Instant::now(),
            commands_handled: 0,
            heartbeats_sent: 0,
        }
    }

    /// Device id.
    pub fn ecu_id(&self) -> &EcuId {
        &self.ecu_id
    }

    fn uptime_secs(&self) -> u64 {
        self.booted.elapsed().as_secs()
    }

    /// Parameters of the next heartbeat notification.
    pub fn heartbeat(&mut self) -> Value {
        self.heartbeats_sent += 1;
        json!({
            "ecu_id": self.ecu_id,
            "seq": self.heartbeats_sent,
            "uptime_secs": self.uptime_secs(),
        })
    }

    /// Decide the reply to `method`.
    pub fn handle(
        &mut self,
        config: &SimulatorConfig,
        method: &str,
        params: Option<Value>,
        faults: Faults,
    ) -> Reply {
        if faults.drop {
            return Reply::Drop;
        }
        self.commands_handled += 1;
        if config.is_unsupported(method) {
            return Reply::Answer(Err(ErrorObject::method_not_found(method)));
        }
        if faults.fail {
            return Reply::Answer(Err(ErrorObject::new(
                ecu_rpc::codes::DEVICE_BUSY,
                "simulated device failure",
            )
            .with_data(json!({"method": method}))));
        }
        let result = match method {
            methods::PING => json!({
                "pong": true,
                "timestamp": Utc::now().to_rfc3339(),
            }),
            methods::GET_STATUS => json!({
                "ecu_id": self.ecu_id,
                "status": "online",
                "uptime_secs": self.uptime_secs(),
                "commands_handled": self.commands_handled,
                "heartbeats_sent": self.heartbeats_sent,
            }),
            methods::DEVICE_INFO => json!({
                "ecu_id": self.ecu_id,
                "device_type": "simulated",
                "firmware_version": FIRMWARE_VERSION,
                "protocol": config.protocol.as_str(),
            }),
            other => json!({
                "method": other,
                "echo": params.unwrap_or(Value::Null),
            }),
        };
        Reply::Answer(Ok(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_device() -> SimulatedDevice {
        SimulatedDevice::new(EcuId::parse("sim_001").unwrap())
    }

    #[test]
    fn answers_builtin_methods() {
        let config = SimulatorConfig::default();
        let mut device = make_device();
        assert_matches!(
            device.handle(&config, "ping", None, Faults::default()),
            Reply::Answer(Ok(v)) if v["pong"] == true
        );
        assert_matches!(
            device.handle(&config, "device_info", None, Faults::default()),
            Reply::Answer(Ok(v)) if v["firmware_version"] == FIRMWARE_VERSION
        );
        assert_matches!(
            device.handle(&config, "get_status", None, Faults::default()),
            Reply::Answer(Ok(v)) if v["commands_handled"] == 3
        );
    }

    #[test]
    fn echoes_other_methods() {
        let config = SimulatorConfig::default();
        let mut device = make_device();
        let reply = device.handle(&config, "unlock", Some(json!({"slot": 2})), Faults::default());
        assert_eq!(
            reply,
            Reply::Answer(Ok(json!({"method": "unlock", "echo": {"slot": 2}})))
        );
    }

    #[test]
    fn unsupported_and_faults() {
        let config = SimulatorConfig::default().with_unsupported("reboot");
        let mut device = make_device();
        assert_matches!(
            device.handle(&config, "reboot", None, Faults::default()),
            Reply::Answer(Err(e)) if e.code == ecu_rpc::codes::METHOD_NOT_FOUND
        );
        assert_matches!(
            device.handle(&config, "ping", None, Faults { fail: true, drop: false }),
            Reply::Answer(Err(e)) if e.code == ecu_rpc::codes::DEVICE_BUSY
        );
        assert_eq!(
            device.handle(&config, "ping", None, Faults { fail: true, drop: true }),
            Reply::Drop
        );
    }

    #[test]
    fn heartbeat_sequence_increments() {
        let mut device = make_device();
        assert_eq!(device.heartbeat()["seq"], 1);
        assert_eq!(device.heartbeat()["seq"], 2);
    }
}
