//! Outbound routing across the socket server and the simulator.

use std::sync::Arc;

use async_trait::async_trait;
use ecu_core::EcuId;
use ecu_runtime::{Transport, TransportError};
use ecu_server::WsTransport;
use ecu_simulator::SimulatedFleet;

/// Sends to a simulated device when one runs under the id, otherwise to
/// the device's socket.
pub struct RoutedTransport {
    sockets: Arc<WsTransport>,
    simulated: Option<Arc<SimulatedFleet>>,
}

impl RoutedTransport {
    /// Route through `sockets`, and through `simulated` for its devices.
    pub fn new(sockets: Arc<WsTransport>, simulated: Option<Arc<SimulatedFleet>>) -> Self {
        Self { sockets, simulated }
    }
}

#[async_trait]
impl Transport for RoutedTransport {
    async fn send(&self, ecu_id: &EcuId, text: String) -> Result<(), TransportError> {
        match &self.simulated {
            Some(fleet) if fleet.epoch(ecu_id).is_some() => fleet.send(ecu_id, text).await,
            _ => self.sockets.send(ecu_id, text).await,
        }
    }

    fn close_session(&self, ecu_id: &EcuId, epoch: u64) -> bool {
        match &self.simulated {
            Some(fleet) if fleet.epoch(ecu_id).is_some() => fleet.close_session(ecu_id, epoch),
            _ => self.sockets.close_session(ecu_id, epoch),
        }
    }
}
