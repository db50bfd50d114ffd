//! Producer-side buffer of the action log pipeline.
//!
//! Pure synchronous state guarded by the pipeline's mutex: the FIFO of log
//! entries, the coalesced snapshot operations, and the escalation flag.

use std::collections::{HashMap, VecDeque};

use ecu_core::EcuId;

use crate::store::SnapshotOp;
use crate::types::ActionLogEntry;

/// Result of offering an entry to the buffer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    /// Entry queued; `shed` entries were dropped to respect the ceiling.
    Accepted { shed: Shed },
    /// Entry refused because the pipeline is escalated.
    Rejected,
}

/// Entries dropped from the head of the queue by the ceiling.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub(crate) struct Shed {
    pub critical: usize,
    pub other: usize,
}

impl Shed {
    pub(crate) fn is_empty(self) -> bool {
        self.critical == 0 && self.other == 0
    }
}

#[derive(Default)]
pub(crate) struct Buffer {
    queue: VecDeque<ActionLogEntry>,
    snapshots: HashMap<EcuId, SnapshotOp>,
    escalated: bool,
}

impl Buffer {
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn pending_snapshots(&self) -> usize {
        self.snapshots.len()
    }

    pub(crate) fn is_escalated(&self) -> bool {
        self.escalated
    }

    /// Queue an entry unless escalation refuses it.
    pub(crate) fn push(&mut self, entry: ActionLogEntry, ceiling: usize) -> PushOutcome {
        if self.escalated && !entry.is_audit_critical() {
            return PushOutcome::Rejected;
        }
        self.queue.push_back(entry);
        let shed = if self.escalated {
            self.enforce_ceiling(ceiling)
        } else {
            Shed::default()
        };
        PushOutcome::Accepted { shed }
    }

    /// Remove up to `max` entries from the head.
    pub(crate) fn take_batch(&mut self, max: usize) -> Vec<ActionLogEntry> {
        let n = max.min(self.queue.len());
        self.queue.drain(..n).collect()
    }

    /// Put entries back at the head, keeping their relative order.
    pub(crate) fn requeue_front(&mut self, entries: Vec<ActionLogEntry>) {
        for entry in entries.into_iter().rev() {
            self.queue.push_front(entry);
        }
    }

    /// Enter escalation after a critical batch exhausted its retries.
    pub(crate) fn escalate(&mut self, ceiling: usize) -> Shed {
        self.escalated = true;
        self.enforce_ceiling(ceiling)
    }

    /// Leave escalation; returns whether it was active.
    pub(crate) fn recover(&mut self) -> bool {
        std::mem::replace(&mut self.escalated, false)
    }

    /// At the ceiling the oldest entries are shed and admission reopens.
    fn enforce_ceiling(&mut self, ceiling: usize) -> Shed {
        let mut shed = Shed::default();
        if self.queue.len() <= ceiling {
            return shed;
        }
        let excess = self.queue.len() - ceiling;
        for entry in self.queue.drain(..excess) {
            if entry.is_audit_critical() {
                shed.critical += 1;
            } else {
                shed.other += 1;
            }
        }
        self.escalated = false;
        shed
    }

    /// Coalesce a snapshot write with any pending one for the same device.
    pub(crate) fn push_snapshot(&mut self, op: SnapshotOp) {
        let key = op.ecu_id().clone();
        let merged = match self.snapshots.remove(&key) {
            Some(older) => older.merge(op),
            None => op,
        };
        let _ = self.snapshots.insert(key, merged);
    }

    pub(crate) fn take_snapshots(&mut self) -> Vec<SnapshotOp> {
        self.snapshots.drain().map(|(_, op)| op).collect()
    }

    /// Re-buffer a failed snapshot write beneath anything newer.
    pub(crate) fn restore_snapshot(&mut self, op: SnapshotOp) {
        let key = op.ecu_id().clone();
        let merged = match self.snapshots.remove(&key) {
            Some(newer) => op.merge(newer),
            None => op,
        };
        let _ = self.snapshots.insert(key, merged);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ActionData, ConnectionRecord, ConnectionStatus, DisconnectData, DisconnectReason,
        HeartbeatData,
    };
    use chrono::Utc;
    use ecu_core::Protocol;

    fn ecu(id: &str) -> EcuId {
        EcuId::parse(id).unwrap()
    }

    fn heartbeat(id: &str, beats: u64) -> ActionLogEntry {
        ActionLogEntry::new(
            ecu(id),
            ActionData::Heartbeat(HeartbeatData {
                beats,
                session_epoch: 1,
            }),
        )
    }

    fn disconnect(id: &str) -> ActionLogEntry {
        ActionLogEntry::new(
            ecu(id),
            ActionData::Disconnect(DisconnectData {
                reason: DisconnectReason::ClientClose,
                session_epoch: 1,
                previous_status: ConnectionStatus::Connected,
            }),
        )
    }

    #[test]
    fn fifo_batches() {
        let mut buf = Buffer::default();
        for n in 0..5 {
            assert_eq!(
                buf.push(heartbeat("a", n), 100),
                PushOutcome::Accepted {
                    shed: Shed::default()
                }
            );
        }
        let batch = buf.take_batch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(buf.len(), 2);
        assert!(matches!(
            batch[0].action,
            ActionData::Heartbeat(HeartbeatData { beats: 0, .. })
        ));
    }

    #[test]
    fn requeue_preserves_order_ahead_of_newer() {
        let mut buf = Buffer::default();
        let _ = buf.push(heartbeat("a", 9), 100);
        buf.requeue_front(vec![heartbeat("a", 1), heartbeat("a", 2)]);
        let beats: Vec<u64> = buf
            .take_batch(10)
            .into_iter()
            .map(|e| match e.action {
                ActionData::Heartbeat(h) => h.beats,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(beats, vec![1, 2, 9]);
    }

    #[test]
    fn escalation_rejects_non_critical_only() {
        let mut buf = Buffer::default();
        assert!(buf.escalate(100).is_empty());
        assert_eq!(buf.push(heartbeat("a", 1), 100), PushOutcome::Rejected);
        assert!(matches!(buf.push(disconnect("a"), 100), PushOutcome::Accepted { .. }));
        assert!(buf.recover());
        assert!(!buf.recover());
        assert!(matches!(buf.push(heartbeat("a", 1), 100), PushOutcome::Accepted { .. }));
    }

    #[test]
    fn ceiling_sheds_oldest_and_reopens() {
        let mut buf = Buffer::default();
        let _ = buf.push(heartbeat("a", 1), 2);
        let _ = buf.escalate(2);
        let _ = buf.push(disconnect("a"), 2);
        let outcome = buf.push(disconnect("b"), 2);
        assert_eq!(
            outcome,
            PushOutcome::Accepted {
                shed: Shed {
                    critical: 0,
                    other: 1
                }
            }
        );
        assert!(!buf.is_escalated());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn snapshots_coalesce_per_device() {
        let mut buf = Buffer::default();
        let record = ConnectionRecord {
            ecu_id: ecu("a"),
            protocol: Protocol::Simulator,
            ip_address: None,
            port: None,
            connected_at: Utc::now(),
            last_heartbeat: None,
            status: ConnectionStatus::Connected,
            session_epoch: 1,
        };
        buf.push_snapshot(SnapshotOp::Upsert(record));
        buf.push_snapshot(SnapshotOp::Status {
            ecu_id: ecu("a"),
            status: ConnectionStatus::Timeout,
        });
        buf.push_snapshot(SnapshotOp::Status {
            ecu_id: ecu("b"),
            status: ConnectionStatus::Disconnected,
        });
        assert_eq!(buf.pending_snapshots(), 2);

        let ops = buf.take_snapshots();
        let a = ops.iter().find(|op| op.ecu_id().as_str() == "a").unwrap();
        assert!(matches!(a, SnapshotOp::Upsert(r) if r.status == ConnectionStatus::Timeout));
    }

    #[test]
    fn restored_snapshot_yields_to_newer() {
        let mut buf = Buffer::default();
        let old = SnapshotOp::Status {
            ecu_id: ecu("a"),
            status: ConnectionStatus::Timeout,
        };
        buf.push_snapshot(SnapshotOp::Status {
            ecu_id: ecu("a"),
            status: ConnectionStatus::Disconnected,
        });
        buf.restore_snapshot(old);
        let ops = buf.take_snapshots();
        assert_eq!(ops.len(), 1);
        assert!(matches!(
            ops[0],
            SnapshotOp::Status {
                status: ConnectionStatus::Disconnected,
                ..
            }
        ));
    }
}
