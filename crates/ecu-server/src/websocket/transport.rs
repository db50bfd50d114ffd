//! Outbound routing from the session core to device sockets.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ecu_core::{ConnectionId, EcuId};
use ecu_runtime::{Transport, TransportError};
use tokio::sync::mpsc;
use tracing::debug;

/// Close code sent to a socket replaced by a newer connection.
pub const CLOSE_SUPERSEDED: u16 = 4000;
/// Close code for a refused handshake.
pub const CLOSE_HANDSHAKE_FAILED: u16 = 4001;
/// Close code when the connection limit is reached.
pub const CLOSE_CAPACITY: u16 = 4002;
/// Close code after the device's session timed out.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4003;
/// Close code at server shutdown (`1001`, going away).
pub const CLOSE_GOING_AWAY: u16 = 1001;

fn superseded(tx: &mpsc::Sender<Outbound>) {
    let _ = tx.try_send(Outbound::Close {
        code: CLOSE_SUPERSEDED,
        reason: "superseded by a newer connection".into(),
    });
}

/// Frames queued for a connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// JSON text frame.
    Text(String),
    /// Close the socket.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

struct DeviceLink {
    connection_id: ConnectionId,
    epoch: u64,
    tx: mpsc::Sender<Outbound>,
}

/// Maps each device to the socket currently serving it.
pub struct WsTransport {
    links: DashMap<EcuId, DeviceLink>,
    max_message_bytes: usize,
}

impl WsTransport {
    /// Empty routing table.
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            links: DashMap::new(),
            max_message_bytes,
        }
    }

    /// Route the device to a new socket. The socket of the newer session
    /// wins: a previous socket with a lower epoch is told to close, and an
    /// incoming socket older than the bound one is closed instead. Returns
    /// whether the incoming socket was bound.
    pub fn bind(
        &self,
        ecu_id: EcuId,
        connection_id: ConnectionId,
        epoch: u64,
        tx: mpsc::Sender<Outbound>,
    ) -> bool {
        let link = DeviceLink {
            connection_id,
            epoch,
            tx,
        };
        match self.links.entry(ecu_id) {
            Entry::Occupied(mut slot) => {
                if slot.get().epoch > epoch {
                    debug!(
                        ecu_id = %slot.key(),
                        connection_id = %link.connection_id,
                        epoch,
                        current = slot.get().epoch,
                        "refusing socket of superseded session"
                    );
                    superseded(&link.tx);
                    return false;
                }
                let previous = slot.insert(link);
                debug!(
                    ecu_id = %slot.key(),
                    connection_id = %previous.connection_id,
                    epoch = previous.epoch,
                    "closing superseded socket"
                );
                superseded(&previous.tx);
            }
            Entry::Vacant(slot) => {
                let _ = slot.insert(link);
            }
        }
        true
    }

    /// Ask the socket serving session `epoch` to close. Returns `false` when
    /// the device is bound to another session or not bound at all.
    pub fn close_epoch(&self, ecu_id: &EcuId, epoch: u64, code: u16, reason: &str) -> bool {
        self.links
            .get(ecu_id)
            .filter(|link| link.epoch == epoch)
            .is_some_and(|link| {
                link.tx
                    .try_send(Outbound::Close {
                        code,
                        reason: reason.to_owned(),
                    })
                    .is_ok()
            })
    }

    /// Remove the route if it still points at `connection_id`.
    pub fn unbind(&self, ecu_id: &EcuId, connection_id: &ConnectionId) -> bool {
        self.links
            .remove_if(ecu_id, |_, link| link.connection_id == *connection_id)
            .is_some()
    }

    /// Session epoch of the socket serving the device.
    pub fn epoch(&self, ecu_id: &EcuId) -> Option<u64> {
        self.links.get(ecu_id).map(|link| link.epoch)
    }

    /// Devices with a bound socket.
    pub fn connection_count(&self) -> usize {
        self.links.len()
    }

    /// Ask every socket to close.
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        let mut closed = 0;
        for link in &self.links {
            if link
                .tx
                .try_send(Outbound::Close {
                    code,
                    reason: reason.to_owned(),
                })
                .is_ok()
            {
                closed += 1;
            }
        }
        closed
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, ecu_id: &EcuId, text: String) -> Result<(), TransportError> {
        if text.len() > self.max_message_bytes {
            return Err(TransportError::TooLarge {
                size: text.len(),
                limit: self.max_message_bytes,
            });
        }
        // clone so no map guard is held across the await
        let tx = self
            .links
            .get(ecu_id)
            .map(|link| link.tx.clone())
            .ok_or_else(|| TransportError::NoConnection(ecu_id.clone()))?;
        tx.send(Outbound::Text(text))
            .await
            .map_err(|_| TransportError::Closed(ecu_id.clone()))
    }

    fn close_session(&self, ecu_id: &EcuId, epoch: u64) -> bool {
        self.close_epoch(ecu_id, epoch, CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout")
    }
}
