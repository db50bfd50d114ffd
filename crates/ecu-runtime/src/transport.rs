//! Boundary between byte-level transports and the session core.
//!
//! A transport adapter (WebSocket server, simulator, Modbus bridge) owns the
//! sockets. It pushes connection lifecycle events into a
//! [`TransportListener`] and accepts outbound text through [`Transport`].

use async_trait::async_trait;
use ecu_core::{EcuId, Protocol};
use ecu_events::ConnectionRecord;

use crate::errors::{RegistryError, TransportError};

/// Outbound half: deliver a text frame to a connected device.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one JSON-RPC text frame to the device's current connection.
    async fn send(&self, ecu_id: &EcuId, text: String) -> Result<(), TransportError>;

    /// Drop the connection that serves session `epoch` so the device
    /// reconnects. Called after the session timed out. Returns whether a
    /// connection was asked to close; transports without that ability
    /// keep the default.
    fn close_session(&self, _ecu_id: &EcuId, _epoch: u64) -> bool {
        false
    }
}

/// Where the peer of a new connection is.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerInfo {
    /// Peer IP address.
    pub ip_address: Option<String>,
    /// Peer port (or the port the device reported in its handshake).
    pub port: Option<u16>,
}

/// Inbound half: lifecycle and message events from a transport.
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// A device completed its handshake. The returned record carries the
    /// session epoch the transport must quote when the connection closes.
    fn on_connect(
        &self,
        ecu_id: EcuId,
        protocol: Protocol,
        peer: PeerInfo,
    ) -> Result<ConnectionRecord, RegistryError>;

    /// A text frame arrived from the device.
    async fn on_message(&self, ecu_id: &EcuId, text: &str);

    /// The connection that opened session `epoch` closed.
    async fn on_close(&self, ecu_id: &EcuId, epoch: u64);
}
