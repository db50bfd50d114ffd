//! Per-device connection state machine.
//!
//! ```text
//!   Disconnected ──connect──▶ Connected ◀──heartbeat──┐
//!        ▲     ▲                 │  └─────────────────┘
//!        │     └──disconnect─────┤
//!        │                   timed out
//!        │                       ▼
//!        └─────disconnect──── Timeout ──connect──▶ Connected
//! ```
//!
//! `Connected --connect--> Connected` is legal: the registry runs it as a
//! takeover (disconnect, then connect). Every other pair is refused without
//! mutation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ecu_core::{EcuId, Protocol};
use ecu_events::{ConnectionRecord, ConnectionStatus};
use serde::Serialize;
use tokio::time::Instant;

use crate::errors::RegistryError;
use crate::transport::PeerInfo;

/// Input to the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    /// Transport handshake completed.
    Connect,
    /// Liveness signal.
    Heartbeat,
    /// Heartbeat monitor found the session stale.
    TimedOut,
    /// Session ended.
    Disconnect,
}

/// Target state of `event` from `from`, or `None` when the pair is illegal.
pub fn next_state(from: ConnectionStatus, event: SessionEvent) -> Option<ConnectionStatus> {
    use ConnectionStatus::{Connected, Disconnected, Timeout};
    match (from, event) {
        (_, SessionEvent::Connect) | (Connected, SessionEvent::Heartbeat) => Some(Connected),
        (Connected, SessionEvent::TimedOut) => Some(Timeout),
        (Connected | Timeout, SessionEvent::Disconnect) => Some(Disconnected),
        (Disconnected | Timeout, SessionEvent::Heartbeat)
        | (Disconnected | Timeout, SessionEvent::TimedOut)
        | (Disconnected, SessionEvent::Disconnect) => None,
    }
}

/// One device's session: the snapshot record plus monotonic timing.
#[derive(Debug)]
pub(crate) struct DeviceSession {
    record: ConnectionRecord,
    connected_at: Instant,
    last_beat: Option<Instant>,
    unlogged_beats: u64,
    last_beat_logged: Option<Instant>,
}

impl DeviceSession {
    /// First session of a device.
    pub(crate) fn open(
        ecu_id: EcuId,
        protocol: Protocol,
        peer: PeerInfo,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Self {
        Self {
            record: ConnectionRecord {
                ecu_id,
                protocol,
                ip_address: peer.ip_address,
                port: peer.port,
                connected_at: wall,
                last_heartbeat: None,
                status: ConnectionStatus::Connected,
                session_epoch: 1,
            },
            connected_at: now,
            last_beat: None,
            unlogged_beats: 0,
            last_beat_logged: None,
        }
    }

    pub(crate) fn record(&self) -> &ConnectionRecord {
        &self.record
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.record.status
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.record.session_epoch
    }

    fn apply(&mut self, event: SessionEvent) -> Result<ConnectionStatus, RegistryError> {
        let from = self.record.status;
        let to = next_state(from, event).ok_or_else(|| RegistryError::InvalidTransition {
            ecu_id: self.record.ecu_id.clone(),
            from,
            event,
        })?;
        self.record.status = to;
        Ok(from)
    }

    /// Start a new session on an existing slot. Returns the previous status.
    pub(crate) fn reconnect(
        &mut self,
        protocol: Protocol,
        peer: PeerInfo,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Result<ConnectionStatus, RegistryError> {
        let previous = self.apply(SessionEvent::Connect)?;
        self.record.protocol = protocol;
        self.record.ip_address = peer.ip_address;
        self.record.port = peer.port;
        self.record.connected_at = wall;
        self.record.last_heartbeat = None;
        self.record.session_epoch += 1;
        self.connected_at = now;
        self.last_beat = None;
        self.unlogged_beats = 0;
        self.last_beat_logged = None;
        Ok(previous)
    }

    /// Record a heartbeat. Returns the beat count to log when the log
    /// interval has passed since the last logged heartbeat.
    pub(crate) fn heartbeat(
        &mut self,
        now: Instant,
        wall: DateTime<Utc>,
        log_interval: Duration,
    ) -> Result<Option<u64>, RegistryError> {
        if self.record.status != ConnectionStatus::Connected {
            return Err(RegistryError::NotConnected {
                ecu_id: self.record.ecu_id.clone(),
                status: Some(self.record.status),
            });
        }
        let _ = self.apply(SessionEvent::Heartbeat)?;
        self.last_beat = Some(now);
        self.record.last_heartbeat = Some(wall);
        self.unlogged_beats += 1;

        let due = self
            .last_beat_logged
            .is_none_or(|at| now.duration_since(at) >= log_interval);
        if !due {
            return Ok(None);
        }
        self.last_beat_logged = Some(now);
        Ok(Some(std::mem::take(&mut self.unlogged_beats)))
    }

    /// Time since the last heartbeat, or since connect when none arrived.
    pub(crate) fn silence(&self, now: Instant) -> Duration {
        now.duration_since(self.last_beat.unwrap_or(self.connected_at))
    }

    /// Demote a stale Connected session. Returns the silence that exceeded
    /// `timeout`, or `None` when nothing changed.
    pub(crate) fn expire(&mut self, now: Instant, timeout: Duration) -> Option<Duration> {
        if self.record.status != ConnectionStatus::Connected {
            return None;
        }
        let silence = self.silence(now);
        if silence <= timeout {
            return None;
        }
        self.apply(SessionEvent::TimedOut).ok()?;
        Some(silence)
    }

    /// End the session. Returns the previous status.
    pub(crate) fn disconnect(&mut self) -> Result<ConnectionStatus, RegistryError> {
        if self.record.status == ConnectionStatus::Disconnected {
            return Err(RegistryError::NotConnected {
                ecu_id: self.record.ecu_id.clone(),
                status: Some(ConnectionStatus::Disconnected),
            });
        }
        self.apply(SessionEvent::Disconnect)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use ConnectionStatus::{Connected, Disconnected, Timeout};

    fn make_session() -> DeviceSession {
        DeviceSession::open(
            EcuId::parse("test_bike_001").unwrap(),
            Protocol::Websocket,
            PeerInfo::default(),
            Instant::now(),
            Utc::now(),
        )
    }

    // ── transition table ────────────────────────────────────────────

    #[test]
    fn legal_transitions() {
        assert_eq!(next_state(Disconnected, SessionEvent::Connect), Some(Connected));
        assert_eq!(next_state(Timeout, SessionEvent::Connect), Some(Connected));
        assert_eq!(next_state(Connected, SessionEvent::Connect), Some(Connected));
        assert_eq!(next_state(Connected, SessionEvent::Heartbeat), Some(Connected));
        assert_eq!(next_state(Connected, SessionEvent::TimedOut), Some(Timeout));
        assert_eq!(next_state(Connected, SessionEvent::Disconnect), Some(Disconnected));
        assert_eq!(next_state(Timeout, SessionEvent::Disconnect), Some(Disconnected));
    }

    #[test]
    fn illegal_transitions() {
        assert_eq!(next_state(Disconnected, SessionEvent::Heartbeat), None);
        assert_eq!(next_state(Timeout, SessionEvent::Heartbeat), None);
        assert_eq!(next_state(Timeout, SessionEvent::TimedOut), None);
        assert_eq!(next_state(Disconnected, SessionEvent::TimedOut), None);
        assert_eq!(next_state(Disconnected, SessionEvent::Disconnect), None);
    }

    // ── session ─────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn heartbeat_logging_is_throttled() {
        let mut s = make_session();
        let interval = Duration::from_secs(300);
        assert_eq!(s.heartbeat(Instant::now(), Utc::now(), interval).unwrap(), Some(1));
        for _ in 0..9 {
            tokio::time::advance(Duration::from_secs(30)).await;
            assert_eq!(s.heartbeat(Instant::now(), Utc::now(), interval).unwrap(), None);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(s.heartbeat(Instant::now(), Utc::now(), interval).unwrap(), Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn expire_only_past_timeout() {
        let mut s = make_session();
        let timeout = Duration::from_secs(90);
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(s.expire(Instant::now(), timeout), None);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(s.expire(Instant::now(), timeout), Some(Duration::from_secs(91)));
        assert_eq!(s.status(), Timeout);
        // already demoted
        assert_eq!(s.expire(Instant::now(), timeout), None);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_refused_after_timeout() {
        let mut s = make_session();
        tokio::time::advance(Duration::from_secs(100)).await;
        let _ = s.expire(Instant::now(), Duration::from_secs(90));
        assert_matches!(
            s.heartbeat(Instant::now(), Utc::now(), Duration::ZERO),
            Err(RegistryError::NotConnected {
                status: Some(Timeout),
                ..
            })
        );
    }

    #[test]
    fn reconnect_bumps_epoch_and_resets() {
        let mut s = make_session();
        let _ = s.heartbeat(Instant::now(), Utc::now(), Duration::ZERO).unwrap();
        assert_eq!(s.disconnect().unwrap(), Connected);
        let previous = s
            .reconnect(
                Protocol::Modbus,
                PeerInfo {
                    ip_address: Some("10.0.0.9".into()),
                    port: Some(502),
                },
                Instant::now(),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(previous, Disconnected);
        assert_eq!(s.epoch(), 2);
        assert_eq!(s.record().protocol, Protocol::Modbus);
        assert!(s.record().last_heartbeat.is_none());
    }

    #[test]
    fn second_disconnect_refused() {
        let mut s = make_session();
        let _ = s.disconnect().unwrap();
        assert_matches!(s.disconnect(), Err(RegistryError::NotConnected { .. }));
    }
}
