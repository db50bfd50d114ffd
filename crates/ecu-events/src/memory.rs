//! In-process store with fault injection.
//!
//! Backs the simulator and tests. Failures can be injected for a fixed
//! number of calls or switched on until cleared, which is how sink outages
//! and recoveries are exercised without a real database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use ecu_core::EcuId;
use parking_lot::Mutex;

use crate::errors::{Result, StoreError};
use crate::store::{AdminLogStore, ConnectionStore};
use crate::types::{ActionLogEntry, ActionType, ConnectionRecord, ConnectionStatus};

/// Thread-safe in-memory implementation of both store traits.
#[derive(Default)]
pub struct MemoryStore {
    logs: Mutex<Vec<ActionLogEntry>>,
    connections: Mutex<BTreeMap<EcuId, ConnectionRecord>>,
    fail_next: AtomicU32,
    unavailable: AtomicBool,
    append_attempts: AtomicU64,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` store calls, then recover.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every store call until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `append_batch` calls, including failed ones.
    pub fn append_attempts(&self) -> u64 {
        self.append_attempts.load(Ordering::SeqCst)
    }

    /// Every persisted log entry in insertion order.
    pub fn entries(&self) -> Vec<ActionLogEntry> {
        self.logs.lock().clone()
    }

    /// Persisted entries of one device in insertion order.
    pub fn entries_for(&self, ecu_id: &str) -> Vec<ActionLogEntry> {
        self.logs
            .lock()
            .iter()
            .filter(|e| e.ecu_id.as_str() == ecu_id)
            .cloned()
            .collect()
    }

    /// Action types of one device's entries in insertion order.
    pub fn action_types_for(&self, ecu_id: &str) -> Vec<ActionType> {
        self.entries_for(ecu_id)
            .iter()
            .map(ActionLogEntry::action_type)
            .collect()
    }

    /// Snapshot row of one device.
    pub fn connection(&self, ecu_id: &str) -> Option<ConnectionRecord> {
        self.connections.lock().get(ecu_id).cloned()
    }

    /// All snapshot rows ordered by device id.
    pub fn connections(&self) -> Vec<ConnectionRecord> {
        self.connections.lock().values().cloned().collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".into()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

impl AdminLogStore for MemoryStore {
    fn append_batch(&self, entries: &[ActionLogEntry]) -> Result<()> {
        let _ = self.append_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.logs.lock().extend_from_slice(entries);
        Ok(())
    }
}

impl ConnectionStore for MemoryStore {
    fn upsert(&self, record: &ConnectionRecord) -> Result<()> {
        self.check_available()?;
        let _ = self
            .connections
            .lock()
            .insert(record.ecu_id.clone(), record.clone());
        Ok(())
    }

    fn mark_status(&self, ecu_id: &EcuId, status: ConnectionStatus) -> Result<()> {
        self.check_available()?;
        if let Some(record) = self.connections.lock().get_mut(ecu_id.as_str()) {
            record.status = status;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionData, HeartbeatData};
    use assert_matches::assert_matches;

    fn entry(id: &str) -> ActionLogEntry {
        ActionLogEntry::new(
            EcuId::parse(id).unwrap(),
            ActionData::Heartbeat(HeartbeatData {
                beats: 1,
                session_epoch: 1,
            }),
        )
    }

    #[test]
    fn append_keeps_order() {
        let store = MemoryStore::new();
        store.append_batch(&[entry("a"), entry("b")]).unwrap();
        store.append_batch(&[entry("a")]).unwrap();
        let ids: Vec<_> = store
            .entries()
            .iter()
            .map(|e| e.ecu_id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "a"]);
        assert_eq!(store.entries_for("a").len(), 2);
    }

    #[test]
    fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next(2);
        assert_matches!(store.append_batch(&[entry("a")]), Err(StoreError::Unavailable(_)));
        assert_matches!(store.append_batch(&[entry("a")]), Err(StoreError::Unavailable(_)));
        store.append_batch(&[entry("a")]).unwrap();
        assert_eq!(store.entries().len(), 1);
        assert_eq!(store.append_attempts(), 3);
    }

    #[test]
    fn unavailable_until_cleared() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.append_batch(&[entry("a")]).is_err());
        store.set_unavailable(false);
        assert!(store.append_batch(&[entry("a")]).is_ok());
    }

    #[test]
    fn mark_status_on_missing_row_is_noop() {
        let store = MemoryStore::new();
        let id = EcuId::parse("ghost").unwrap();
        store.mark_status(&id, ConnectionStatus::Timeout).unwrap();
        assert!(store.connection("ghost").is_none());
    }
}
