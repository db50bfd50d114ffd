//! Persisted data model: action log entries and connection snapshots.
//!
//! `action_data` is stored as a JSON column whose shape depends on
//! `action_type`. In memory it is the typed [`ActionData`] enum; the
//! variant determines the action type, and [`ActionData::from_parts`]
//! rebuilds it from a stored `(action_type, json)` pair.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ecu_core::constants::SYSTEM_ADMIN_USER;
use ecu_core::{EcuId, Protocol};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::StoreError;

// ─────────────────────────────────────────────────────────────────────────────
// Enumerations
// ─────────────────────────────────────────────────────────────────────────────

/// Value of the `ecu_admin_logs.action_type` column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// A session was established.
    Connect,
    /// A session ended.
    Disconnect,
    /// A command was dispatched or resolved.
    Command,
    /// A liveness state change (e.g. heartbeat timeout).
    StatusUpdate,
    /// Protocol, transport or dispatch error.
    Error,
    /// Throttled heartbeat record.
    Heartbeat,
}

impl ActionType {
    /// All action types in column order.
    pub const ALL: [Self; 6] = [
        Self::Connect,
        Self::Disconnect,
        Self::Command,
        Self::StatusUpdate,
        Self::Error,
        Self::Heartbeat,
    ];

    /// Column value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Command => "command",
            Self::StatusUpdate => "status_update",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Entries of this type may never be silently dropped by the pipeline.
    pub fn is_audit_critical(self) -> bool {
        matches!(self, Self::Connect | Self::Disconnect | Self::Error)
    }
}

impl FromStr for ActionType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown action_type: {s}")))
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of the `ecu_connections.status` column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Live session with recent heartbeats.
    Connected,
    /// No session.
    Disconnected,
    /// Session exists but heartbeats went stale.
    Timeout,
}

impl ConnectionStatus {
    /// Column value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Timeout => "timeout",
        }
    }
}

impl FromStr for ConnectionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(Self::Connected),
            "disconnected" => Ok(Self::Disconnected),
            "timeout" => Ok(Self::Timeout),
            other => Err(StoreError::InvalidData(format!(
                "unknown connection status: {other}"
            ))),
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The device closed its transport.
    ClientClose,
    /// A newer connection for the same device took over.
    Superseded,
    /// The transport failed underneath the session.
    TransportError,
    /// An operator or API caller requested the disconnect.
    Requested,
    /// The gateway is shutting down.
    Shutdown,
}

/// Category of an `error` entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed JSON-RPC from the device.
    Protocol,
    /// Command dispatch failure (timeout, not connected, duplicate id).
    Dispatch,
    /// Transport adapter failure.
    Transport,
    /// Internal invariant violation.
    Internal,
}

// ─────────────────────────────────────────────────────────────────────────────
// Action payloads
// ─────────────────────────────────────────────────────────────────────────────

/// `action_data` of a `connect` entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectData {
    /// Transport the device arrived on.
    pub protocol: Protocol,
    /// Peer address, when the transport knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Peer port, when the transport knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Session epoch assigned by the registry.
    pub session_epoch: u64,
    /// Whether this connection replaced a live session.
    #[serde(default)]
    pub takeover: bool,
}

/// `action_data` of a `disconnect` entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisconnectData {
    /// Why the session ended.
    pub reason: DisconnectReason,
    /// Epoch of the session that ended.
    pub session_epoch: u64,
    /// State the session was in before the disconnect.
    pub previous_status: ConnectionStatus,
}

/// `action_data` of a `command` entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandData {
    /// JSON-RPC request id, rendered as text. Absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Method invoked on the device.
    pub method: String,
    /// Parameters sent with the request.
    #[serde(default)]
    pub params: Value,
    /// Timestamp of dispatch.
    pub timestamp: DateTime<Utc>,
}

/// `action_data` of a `status_update` entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdateData {
    /// Previous status.
    pub from: ConnectionStatus,
    /// New status.
    pub to: ConnectionStatus,
    /// Short reason tag (e.g. `timeout`).
    pub reason: String,
    /// Seconds since the last heartbeat when the change was detected.
    pub elapsed_secs: u64,
    /// Configured staleness threshold.
    pub timeout_secs: u64,
}

/// `action_data` of an `error` entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Error category.
    pub kind: ErrorKind,
    /// JSON-RPC or application error code, when one applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    /// Human-readable description.
    pub message: String,
    /// Request the error relates to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Method the error relates to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// `action_data` of a `heartbeat` entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatData {
    /// Heartbeats received since the previous logged heartbeat (inclusive).
    pub beats: u64,
    /// Session epoch the heartbeats belong to.
    pub session_epoch: u64,
}

/// Typed `action_data`; the variant determines `action_type`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ActionData {
    /// `connect`
    Connect(ConnectData),
    /// `disconnect`
    Disconnect(DisconnectData),
    /// `command`
    Command(CommandData),
    /// `status_update`
    StatusUpdate(StatusUpdateData),
    /// `error`
    Error(ErrorData),
    /// `heartbeat`
    Heartbeat(HeartbeatData),
}

impl ActionData {
    /// Action type implied by the variant.
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::Connect(_) => ActionType::Connect,
            Self::Disconnect(_) => ActionType::Disconnect,
            Self::Command(_) => ActionType::Command,
            Self::StatusUpdate(_) => ActionType::StatusUpdate,
            Self::Error(_) => ActionType::Error,
            Self::Heartbeat(_) => ActionType::Heartbeat,
        }
    }

    /// Rebuild the typed payload from a stored `(action_type, json)` pair.
    pub fn from_parts(action_type: ActionType, data: Value) -> Result<Self, StoreError> {
        Ok(match action_type {
            ActionType::Connect => Self::Connect(serde_json::from_value(data)?),
            ActionType::Disconnect => Self::Disconnect(serde_json::from_value(data)?),
            ActionType::Command => Self::Command(serde_json::from_value(data)?),
            ActionType::StatusUpdate => Self::StatusUpdate(serde_json::from_value(data)?),
            ActionType::Error => Self::Error(serde_json::from_value(data)?),
            ActionType::Heartbeat => Self::Heartbeat(serde_json::from_value(data)?),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ActionLogEntry
// ─────────────────────────────────────────────────────────────────────────────

/// One immutable row of `ecu_admin_logs`.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionLogEntry {
    /// Device the entry belongs to.
    pub ecu_id: EcuId,
    /// Typed payload.
    pub action: ActionData,
    /// Outcome, for entries that have one (command resolution).
    pub result: Option<Value>,
    /// Actor; `system` for gateway-originated entries.
    pub admin_user: String,
    /// Peer address associated with the event.
    pub ip_address: Option<String>,
    /// Generation time.
    pub created_at: DateTime<Utc>,
}

impl ActionLogEntry {
    /// New system entry stamped with the current time.
    pub fn new(ecu_id: EcuId, action: ActionData) -> Self {
        Self {
            ecu_id,
            action,
            result: None,
            admin_user: SYSTEM_ADMIN_USER.to_string(),
            ip_address: None,
            created_at: Utc::now(),
        }
    }

    /// Attach a result payload.
    #[must_use]
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Attach the peer address.
    #[must_use]
    pub fn with_ip(mut self, ip_address: Option<String>) -> Self {
        self.ip_address = ip_address;
        self
    }

    /// Override the acting user.
    #[must_use]
    pub fn with_admin_user(mut self, admin_user: impl Into<String>) -> Self {
        self.admin_user = admin_user.into();
        self
    }

    /// Column value of `action_type`.
    pub fn action_type(&self) -> ActionType {
        self.action.action_type()
    }

    /// Whether the pipeline must retain this entry through sink outages.
    pub fn is_audit_critical(&self) -> bool {
        self.action_type().is_audit_critical()
    }
}

/// A row read back from `ecu_admin_logs`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AdminLogRow {
    /// Auto-increment id (insertion order).
    pub id: i64,
    /// Device id.
    pub ecu_id: String,
    /// Action type.
    pub action_type: ActionType,
    /// Raw `action_data` JSON.
    pub action_data: Value,
    /// Raw `result` JSON.
    pub result: Option<Value>,
    /// Acting user.
    pub admin_user: String,
    /// Peer address.
    pub ip_address: Option<String>,
    /// Generation time.
    pub created_at: DateTime<Utc>,
}

impl AdminLogRow {
    /// Decode the typed payload.
    pub fn action(&self) -> Result<ActionData, StoreError> {
        ActionData::from_parts(self.action_type, self.action_data.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionRecord
// ─────────────────────────────────────────────────────────────────────────────

/// Current connection snapshot of one device (`ecu_connections` row).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Device id (unique).
    pub ecu_id: EcuId,
    /// Transport tag.
    pub protocol: Protocol,
    /// Peer address.
    pub ip_address: Option<String>,
    /// Peer port.
    pub port: Option<u16>,
    /// When the current (or last) session was established.
    pub connected_at: DateTime<Utc>,
    /// Last heartbeat of the current (or last) session.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Liveness status.
    pub status: ConnectionStatus,
    /// Registry session epoch; not persisted.
    #[serde(skip)]
    pub session_epoch: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn ecu(id: &str) -> EcuId {
        EcuId::parse(id).unwrap()
    }

    #[test]
    fn critical_types() {
        let critical: Vec<_> = ActionType::ALL
            .into_iter()
            .filter(|t| t.is_audit_critical())
            .collect();
        assert_eq!(
            critical,
            vec![ActionType::Connect, ActionType::Disconnect, ActionType::Error]
        );
    }

    #[test]
    fn action_type_column_values() {
        assert_eq!(ActionType::StatusUpdate.as_str(), "status_update");
        assert_eq!(
            "status_update".parse::<ActionType>().unwrap(),
            ActionType::StatusUpdate
        );
        assert_matches!("reboot".parse::<ActionType>(), Err(StoreError::InvalidData(_)));
    }

    #[test]
    fn connection_status_parse() {
        assert_eq!(
            "timeout".parse::<ConnectionStatus>().unwrap(),
            ConnectionStatus::Timeout
        );
        assert!("online".parse::<ConnectionStatus>().is_err());
    }

    #[test]
    fn action_data_serializes_without_tag() {
        let data = ActionData::Disconnect(DisconnectData {
            reason: DisconnectReason::Superseded,
            session_epoch: 1,
            previous_status: ConnectionStatus::Connected,
        });
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(
            value,
            json!({"reason": "superseded", "session_epoch": 1, "previous_status": "connected"})
        );
    }

    #[test]
    fn from_parts_uses_action_type() {
        let value = json!({"beats": 3, "session_epoch": 2});
        let data = ActionData::from_parts(ActionType::Heartbeat, value.clone()).unwrap();
        assert_eq!(data.action_type(), ActionType::Heartbeat);
        assert!(ActionData::from_parts(ActionType::Connect, value).is_err());
    }

    #[test]
    fn entry_defaults_to_system_user() {
        let entry = ActionLogEntry::new(
            ecu("test_bike_001"),
            ActionData::Heartbeat(HeartbeatData {
                beats: 1,
                session_epoch: 1,
            }),
        );
        assert_eq!(entry.admin_user, "system");
        assert!(entry.result.is_none());
        assert!(!entry.is_audit_critical());
    }

    #[test]
    fn record_skips_epoch_in_json() {
        let record = ConnectionRecord {
            ecu_id: ecu("test_gate_001"),
            protocol: Protocol::Websocket,
            ip_address: Some("10.0.0.7".into()),
            port: Some(5000),
            connected_at: Utc::now(),
            last_heartbeat: None,
            status: ConnectionStatus::Connected,
            session_epoch: 9,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("session_epoch").is_none());
        assert_eq!(value["status"], "connected");
    }
}
