//! Session registry: the authoritative map of device → connection state.
//!
//! Every device owns a slot guarded by its own mutex. Register, heartbeat,
//! disconnect and timeout transitions take that mutex for the synchronous
//! mutation only, so racing operations on one device observe a total order
//! while distinct devices never contend. Log entries and snapshot writes are
//! handed to the pipeline while the slot is held, which keeps per-device log
//! order identical to transition order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use ecu_core::{EcuId, Protocol};
use ecu_events::{
    ActionData, ActionLogEntry, ActionLogPipeline, ConnectData, ConnectionRecord,
    ConnectionStatus, DisconnectData, DisconnectReason, HeartbeatData, StatusUpdateData,
};
use ecu_settings::HeartbeatSettings;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::errors::RegistryError;
use crate::state::DeviceSession;
use crate::transport::PeerInfo;

type Slot = Arc<Mutex<Option<DeviceSession>>>;

/// Registry tuning.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Minimum spacing of logged heartbeats per session.
    pub heartbeat_log_interval: Duration,
}

impl RegistryConfig {
    /// Build from the `heartbeat` settings section.
    pub fn from_settings(settings: &HeartbeatSettings) -> Self {
        Self {
            heartbeat_log_interval: settings.log_interval(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from_settings(&HeartbeatSettings::default())
    }
}

/// Devices per status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounts {
    /// Live sessions.
    pub connected: usize,
    /// Sessions demoted by the heartbeat monitor.
    pub timeout: usize,
    /// Known devices without a session.
    pub disconnected: usize,
}

impl SessionCounts {
    /// Every device the registry has seen.
    pub fn total(&self) -> usize {
        self.connected + self.timeout + self.disconnected
    }
}

/// In-memory connection state for every device.
pub struct SessionRegistry {
    devices: DashMap<EcuId, Slot>,
    pipeline: Arc<ActionLogPipeline>,
    config: RegistryConfig,
    draining: AtomicBool,
}

impl SessionRegistry {
    /// Create an empty registry that logs through `pipeline`.
    pub fn new(config: RegistryConfig, pipeline: Arc<ActionLogPipeline>) -> Self {
        Self {
            devices: DashMap::new(),
            pipeline,
            config,
            draining: AtomicBool::new(false),
        }
    }

    /// Pipeline this registry logs through.
    pub fn pipeline(&self) -> &Arc<ActionLogPipeline> {
        &self.pipeline
    }

    fn slot(&self, ecu_id: &EcuId) -> Option<Slot> {
        self.devices.get(ecu_id).map(|entry| Arc::clone(entry.value()))
    }

    fn slot_or_insert(&self, ecu_id: &EcuId) -> Slot {
        Arc::clone(self.devices.entry(ecu_id.clone()).or_default().value())
    }

    fn slots(&self) -> Vec<Slot> {
        self.devices
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn not_connected(ecu_id: &EcuId) -> RegistryError {
        RegistryError::NotConnected {
            ecu_id: ecu_id.clone(),
            status: None,
        }
    }

    // ── lifecycle ───────────────────────────────────────────────────

    /// Establish a session. A live session for the same device is
    /// superseded: it is disconnected (logged as `superseded`) before the
    /// new one is connected.
    #[instrument(skip(self, peer), fields(ecu_id = %ecu_id, protocol = %protocol.as_str()))]
    pub fn register(
        &self,
        ecu_id: EcuId,
        protocol: Protocol,
        peer: PeerInfo,
    ) -> Result<ConnectionRecord, RegistryError> {
        if self.draining.load(Ordering::Acquire) {
            return Err(RegistryError::Draining { ecu_id });
        }
        let slot = self.slot_or_insert(&ecu_id);
        let now = Instant::now();
        let wall = Utc::now();
        let mut guard = slot.lock();

        let takeover = match guard.as_mut() {
            Some(session) => {
                let takeover = session.status() == ConnectionStatus::Connected;
                if takeover {
                    let previous = session.disconnect()?;
                    self.log_disconnect(session.record(), DisconnectReason::Superseded, previous);
                }
                let _ = session.reconnect(protocol, peer.clone(), now, wall)?;
                takeover
            }
            None => false,
        };
        let session = guard
            .get_or_insert_with(|| DeviceSession::open(ecu_id.clone(), protocol, peer, now, wall));
        let record = session.record().clone();

        self.emit(
            ActionLogEntry::new(
                ecu_id.clone(),
                ActionData::Connect(ConnectData {
                    protocol,
                    ip_address: record.ip_address.clone(),
                    port: record.port,
                    session_epoch: record.session_epoch,
                    takeover,
                }),
            )
            .with_ip(record.ip_address.clone()),
        );
        self.pipeline.upsert_connection(record.clone());
        drop(guard);

        counter!("ecu_sessions_opened_total").increment(1);
        if takeover {
            counter!("ecu_session_takeovers_total").increment(1);
        } else {
            gauge!("ecu_sessions_connected").increment(1.0);
        }
        info!(epoch = record.session_epoch, takeover, "device connected");
        Ok(record)
    }

    /// Record a heartbeat. Fails unless the device is Connected.
    pub fn heartbeat(&self, ecu_id: &EcuId) -> Result<(), RegistryError> {
        let slot = self.slot(ecu_id).ok_or_else(|| Self::not_connected(ecu_id))?;
        let mut guard = slot.lock();
        let session = guard.as_mut().ok_or_else(|| Self::not_connected(ecu_id))?;

        let logged = session.heartbeat(
            Instant::now(),
            Utc::now(),
            self.config.heartbeat_log_interval,
        )?;
        if let Some(beats) = logged {
            self.emit(ActionLogEntry::new(
                ecu_id.clone(),
                ActionData::Heartbeat(HeartbeatData {
                    beats,
                    session_epoch: session.epoch(),
                }),
            ));
        }
        self.pipeline.upsert_connection(session.record().clone());
        drop(guard);

        counter!("ecu_heartbeats_total").increment(1);
        Ok(())
    }

    /// End the device's session on request. A second call on a
    /// Disconnected device fails without logging anything.
    pub fn disconnect(&self, ecu_id: &EcuId) -> Result<ConnectionRecord, RegistryError> {
        self.end(ecu_id, None, DisconnectReason::Requested)?
            .ok_or_else(|| Self::not_connected(ecu_id))
    }

    /// Transport-initiated close of session `epoch`. Returns whether a
    /// session was ended; the close of a superseded connection is ignored.
    pub fn close_session(&self, ecu_id: &EcuId, epoch: u64, reason: DisconnectReason) -> bool {
        match self.end(ecu_id, Some(epoch), reason) {
            Ok(closed) => closed.is_some(),
            Err(e) => {
                debug!(ecu_id = %ecu_id, epoch, error = %e, "close ignored");
                false
            }
        }
    }

    fn end(
        &self,
        ecu_id: &EcuId,
        epoch: Option<u64>,
        reason: DisconnectReason,
    ) -> Result<Option<ConnectionRecord>, RegistryError> {
        let slot = self.slot(ecu_id).ok_or_else(|| Self::not_connected(ecu_id))?;
        let mut guard = slot.lock();
        let session = guard.as_mut().ok_or_else(|| Self::not_connected(ecu_id))?;

        if epoch.is_some_and(|epoch| epoch != session.epoch()) {
            debug!(
                ecu_id = %ecu_id,
                epoch = ?epoch,
                current = session.epoch(),
                "close of superseded connection ignored"
            );
            return Ok(None);
        }

        let previous = session.disconnect()?;
        self.log_disconnect(session.record(), reason, previous);
        self.pipeline
            .mark_status(ecu_id, ConnectionStatus::Disconnected);
        let record = session.record().clone();
        drop(guard);

        if previous == ConnectionStatus::Connected {
            gauge!("ecu_sessions_connected").decrement(1.0);
        }
        info!(ecu_id = %ecu_id, ?reason, epoch = record.session_epoch, "device disconnected");
        Ok(Some(record))
    }

    /// Demote the device to Timeout when its session has been silent for
    /// longer than `timeout`. Returns the silence that triggered it and the
    /// epoch of the expired session.
    pub fn expire_if_stale(&self, ecu_id: &EcuId, timeout: Duration) -> Option<(Duration, u64)> {
        let slot = self.slot(ecu_id)?;
        let mut guard = slot.lock();
        let session = guard.as_mut()?;
        let silence = session.expire(Instant::now(), timeout)?;
        let epoch = session.epoch();

        self.emit(ActionLogEntry::new(
            ecu_id.clone(),
            ActionData::StatusUpdate(StatusUpdateData {
                from: ConnectionStatus::Connected,
                to: ConnectionStatus::Timeout,
                reason: "heartbeat_timeout".into(),
                elapsed_secs: silence.as_secs(),
                timeout_secs: timeout.as_secs(),
            }),
        ));
        self.pipeline.mark_status(ecu_id, ConnectionStatus::Timeout);
        drop(guard);

        gauge!("ecu_sessions_connected").decrement(1.0);
        counter!("ecu_heartbeat_timeouts_total").increment(1);
        warn!(
            ecu_id = %ecu_id,
            silent_secs = silence.as_secs(),
            timeout_secs = timeout.as_secs(),
            "heartbeat timeout"
        );
        Some((silence, epoch))
    }

    /// Disconnect every live session and refuse new ones.
    pub fn drain(&self, reason: DisconnectReason) -> usize {
        self.draining.store(true, Ordering::Release);
        let mut ended = 0;
        for ecu_id in self.device_ids() {
            if self.status(&ecu_id) == Some(ConnectionStatus::Disconnected) {
                continue;
            }
            if matches!(self.end(&ecu_id, None, reason), Ok(Some(_))) {
                ended += 1;
            }
        }
        info!(ended, "session registry drained");
        ended
    }

    // ── queries ─────────────────────────────────────────────────────

    /// Current record of a device.
    pub fn get(&self, ecu_id: &EcuId) -> Option<ConnectionRecord> {
        let slot = self.slot(ecu_id)?;
        let guard = slot.lock();
        guard.as_ref().map(|session| session.record().clone())
    }

    /// Current status of a device.
    pub fn status(&self, ecu_id: &EcuId) -> Option<ConnectionStatus> {
        let slot = self.slot(ecu_id)?;
        let guard = slot.lock();
        guard.as_ref().map(DeviceSession::status)
    }

    /// Whether the device has a Connected session.
    pub fn is_connected(&self, ecu_id: &EcuId) -> bool {
        self.status(ecu_id) == Some(ConnectionStatus::Connected)
    }

    /// Every known record ordered by device id.
    pub fn snapshot(&self) -> Vec<ConnectionRecord> {
        let mut records: Vec<ConnectionRecord> = self
            .slots()
            .into_iter()
            .filter_map(|slot| slot.lock().as_ref().map(|s| s.record().clone()))
            .collect();
        records.sort_by(|a, b| a.ecu_id.cmp(&b.ecu_id));
        records
    }

    /// Every known device id, sorted.
    pub fn device_ids(&self) -> Vec<EcuId> {
        let mut ids: Vec<EcuId> = self.devices.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Connected device ids, sorted.
    pub fn connected_ids(&self) -> Vec<EcuId> {
        self.snapshot()
            .into_iter()
            .filter(|r| r.status == ConnectionStatus::Connected)
            .map(|r| r.ecu_id)
            .collect()
    }

    /// Devices per status.
    pub fn counts(&self) -> SessionCounts {
        let mut counts = SessionCounts::default();
        for slot in self.slots() {
            match slot.lock().as_ref().map(DeviceSession::status) {
                Some(ConnectionStatus::Connected) => counts.connected += 1,
                Some(ConnectionStatus::Timeout) => counts.timeout += 1,
                Some(ConnectionStatus::Disconnected) => counts.disconnected += 1,
                None => {}
            }
        }
        counts
    }

    // ── logging ─────────────────────────────────────────────────────

    fn log_disconnect(
        &self,
        record: &ConnectionRecord,
        reason: DisconnectReason,
        previous: ConnectionStatus,
    ) {
        self.emit(
            ActionLogEntry::new(
                record.ecu_id.clone(),
                ActionData::Disconnect(DisconnectData {
                    reason,
                    session_epoch: record.session_epoch,
                    previous_status: previous,
                }),
            )
            .with_ip(record.ip_address.clone()),
        );
    }

    fn emit(&self, entry: ActionLogEntry) {
        let _ = self.pipeline.record(entry);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
