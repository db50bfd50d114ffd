//! Store adapter boundaries.
//!
//! Both traits are synchronous: they are only ever called from the action
//! log pipeline's consumer, which owns all writes to the backing store.

use ecu_core::EcuId;

use crate::errors::Result;
use crate::types::{ActionLogEntry, ConnectionRecord, ConnectionStatus};

/// Append-only sink for `ecu_admin_logs`.
pub trait AdminLogStore: Send + Sync {
    /// Persist a batch atomically: either every entry is stored, in slice
    /// order, or none is.
    fn append_batch(&self, entries: &[ActionLogEntry]) -> Result<()>;
}

/// Writer for the `ecu_connections` snapshot table.
pub trait ConnectionStore: Send + Sync {
    /// Insert or replace the snapshot row for `record.ecu_id`.
    fn upsert(&self, record: &ConnectionRecord) -> Result<()>;

    /// Update only the status column. A missing row is not an error.
    fn mark_status(&self, ecu_id: &EcuId, status: ConnectionStatus) -> Result<()>;
}

/// A pending write to the connection snapshot table.
///
/// Snapshot writes describe current state, so a newer operation for the
/// same device supersedes an older one; see [`SnapshotOp::merge`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotOp {
    /// Write the whole row.
    Upsert(ConnectionRecord),
    /// Update the status column.
    Status {
        /// Device id.
        ecu_id: EcuId,
        /// New status.
        status: ConnectionStatus,
    },
}

impl SnapshotOp {
    /// Device the operation targets.
    pub fn ecu_id(&self) -> &EcuId {
        match self {
            Self::Upsert(record) => &record.ecu_id,
            Self::Status { ecu_id, .. } => ecu_id,
        }
    }

    /// Combine with a newer operation for the same device.
    ///
    /// A newer upsert replaces anything older; a newer status applied to an
    /// older upsert is folded into that upsert so the row is still created.
    #[must_use]
    pub fn merge(self, newer: Self) -> Self {
        match (self, newer) {
            (Self::Upsert(mut record), Self::Status { status, .. }) => {
                record.status = status;
                Self::Upsert(record)
            }
            (_, newer) => newer,
        }
    }

    /// Apply this operation to a connection store.
    pub fn apply(&self, store: &dyn ConnectionStore) -> Result<()> {
        match self {
            Self::Upsert(record) => store.upsert(record),
            Self::Status { ecu_id, status, .. } => store.mark_status(ecu_id, *status),
        }
    }
}
