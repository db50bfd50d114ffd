//! Runtime error types.

use std::time::Duration;

use ecu_core::EcuId;
use ecu_events::ConnectionStatus;
use ecu_rpc::{ErrorObject, RpcId, codes};

use crate::state::SessionEvent;

/// Session registry failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The device has no Connected session.
    #[error("device {ecu_id} is not connected (status: {})", .status.map_or("unknown", ConnectionStatus::as_str))]
    NotConnected {
        /// Device id.
        ecu_id: EcuId,
        /// Current status, `None` when the device was never seen.
        status: Option<ConnectionStatus>,
    },

    /// The state machine refused the event.
    #[error("invalid transition for {ecu_id}: {event:?} in state {from}")]
    InvalidTransition {
        /// Device id.
        ecu_id: EcuId,
        /// State before the event.
        from: ConnectionStatus,
        /// Refused event.
        event: SessionEvent,
    },

    /// The registry was drained for shutdown and accepts no new sessions.
    #[error("registry is draining, refusing session for {ecu_id}")]
    Draining {
        /// Device id.
        ecu_id: EcuId,
    },
}

/// Transport adapter failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No open connection for the device.
    #[error("no open connection for {0}")]
    NoConnection(EcuId),

    /// The connection closed while sending.
    #[error("connection to {0} closed")]
    Closed(EcuId),

    /// Frame exceeds the configured limit.
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    TooLarge {
        /// Frame size in bytes.
        size: usize,
        /// Limit in bytes.
        limit: usize,
    },

    /// Adapter-specific failure.
    #[error("transport failure: {0}")]
    Other(String),
}

/// Command dispatch failures returned by `send` and `notify`.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No response before the deadline.
    #[error("request {request_id} ({method}) to {ecu_id} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// Device id.
        ecu_id: EcuId,
        /// Method invoked.
        method: String,
        /// Request id.
        request_id: RpcId,
        /// Deadline used.
        timeout: Duration,
    },

    /// The device has no Connected session.
    #[error("device {ecu_id} is not connected")]
    NotConnected {
        /// Device id.
        ecu_id: EcuId,
    },

    /// The allocated id is already outstanding.
    #[error("request id {request_id} is already outstanding")]
    DuplicateId {
        /// Colliding id.
        request_id: RpcId,
    },

    /// The request was cancelled before a response arrived.
    #[error("request {request_id} was cancelled")]
    Cancelled {
        /// Request id.
        request_id: RpcId,
    },

    /// The transport could not deliver the message.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The device answered with a JSON-RPC error.
    #[error("device error {0}")]
    Remote(ErrorObject),

    /// The outbound message could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DispatchError {
    /// JSON-RPC code describing the failure.
    pub fn code(&self) -> i64 {
        match self {
            Self::Timeout { .. } => codes::COMMAND_TIMEOUT,
            Self::NotConnected { .. } => codes::DEVICE_OFFLINE,
            Self::Transport(_) => codes::NETWORK_ERROR,
            Self::Remote(e) => e.code,
            Self::DuplicateId { .. } | Self::Cancelled { .. } | Self::Encode(_) => {
                codes::INTERNAL_ERROR
            }
        }
    }

    /// Short category tag for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::NotConnected { .. } => "not_connected",
            Self::DuplicateId { .. } => "duplicate_id",
            Self::Cancelled { .. } => "cancelled",
            Self::Transport(_) => "transport",
            Self::Remote(_) => "remote",
            Self::Encode(_) => "encode",
        }
    }

    /// Whether retrying the same command may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport(_) => true,
            Self::Remote(e) => e.code == codes::DEVICE_BUSY,
            Self::NotConnected { .. }
            | Self::DuplicateId { .. }
            | Self::Cancelled { .. }
            | Self::Encode(_) => false,
        }
    }
}

impl From<RegistryError> for DispatchError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotConnected { ecu_id, .. }
            | RegistryError::InvalidTransition { ecu_id, .. }
            | RegistryError::Draining { ecu_id } => Self::NotConnected { ecu_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ecu() -> EcuId {
        EcuId::parse("test_gate_001").unwrap()
    }

    #[test]
    fn dispatch_codes() {
        let timeout = DispatchError::Timeout {
            ecu_id: ecu(),
            method: "ping".into(),
            request_id: RpcId::Number(1),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(timeout.code(), -32004);
        assert_eq!(timeout.category(), "timeout");
        assert!(timeout.is_retryable());
        assert_eq!(DispatchError::NotConnected { ecu_id: ecu() }.code(), -32001);
        assert_eq!(
            DispatchError::Remote(ErrorObject::new(-32601, "nope")).code(),
            -32601
        );
    }

    #[test]
    fn busy_device_is_retryable() {
        assert!(DispatchError::Remote(ErrorObject::new(codes::DEVICE_BUSY, "busy")).is_retryable());
        assert!(!DispatchError::Cancelled {
            request_id: RpcId::Number(1)
        }
        .is_retryable());
    }

    #[test]
    fn registry_error_message() {
        let err = RegistryError::NotConnected {
            ecu_id: ecu(),
            status: Some(ConnectionStatus::Timeout),
        };
        assert_eq!(
            err.to_string(),
            "device test_gate_001 is not connected (status: timeout)"
        );
        assert_matches::assert_matches!(
            DispatchError::from(err),
            DispatchError::NotConnected { .. }
        );
    }
}
