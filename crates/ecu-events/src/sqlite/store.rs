//! `SQLite` implementation of the store traits plus read-side queries.
//!
//! Writes happen in a single transaction per batch using cached prepared
//! statements. Timestamps are stored as RFC 3339 UTC strings with
//! millisecond precision.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use ecu_core::{EcuId, Protocol};
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument};

use super::connection::{ConnectionPool, PooledConnection};
use crate::errors::{Result, StoreError};
use crate::store::{AdminLogStore, ConnectionStore};
use crate::types::{ActionLogEntry, ActionType, AdminLogRow, ConnectionRecord, ConnectionStatus};

/// Filter for [`SqliteStore::device_logs`].
#[derive(Clone, Debug)]
pub struct LogQuery {
    /// Restrict to one action type.
    pub action_type: Option<ActionType>,
    /// Maximum rows returned (newest first).
    pub limit: u32,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            action_type: None,
            limit: 100,
        }
    }
}

/// Aggregate counts over both tables.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LogStatistics {
    /// Rows in `ecu_admin_logs`.
    pub total_logs: u64,
    /// Rows per action type.
    pub logs_by_type: BTreeMap<String, u64>,
    /// Rows in `ecu_connections`.
    pub total_devices: u64,
    /// Snapshot rows per status.
    pub devices_by_status: BTreeMap<String, u64>,
}

/// Pooled `SQLite` store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: ConnectionPool,
}

impl SqliteStore {
    /// Wrap a pool whose schema is already migrated.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Newest-first log rows of one device.
    pub fn device_logs(&self, ecu_id: &str, query: &LogQuery) -> Result<Vec<AdminLogRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, ecu_id, action_type, action_data, result, admin_user, ip_address, created_at
             FROM ecu_admin_logs
             WHERE ecu_id = ?1 AND (?2 IS NULL OR action_type = ?2)
             ORDER BY id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![
                ecu_id,
                query.action_type.map(ActionType::as_str),
                query.limit
            ],
            raw_log_row,
        )?;
        rows.map(|r| r.map_err(StoreError::from).and_then(RawLogRow::decode))
            .collect()
    }

    /// Newest-first log rows across all devices.
    pub fn recent_logs(&self, limit: u32) -> Result<Vec<AdminLogRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, ecu_id, action_type, action_data, result, admin_user, ip_address, created_at
             FROM ecu_admin_logs
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], raw_log_row)?;
        rows.map(|r| r.map_err(StoreError::from).and_then(RawLogRow::decode))
            .collect()
    }

    /// Snapshot row of one device.
    pub fn connection(&self, ecu_id: &str) -> Result<Option<ConnectionRecord>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT ecu_id, protocol, ip_address, port, connected_at, last_heartbeat, status
                 FROM ecu_connections WHERE ecu_id = ?1",
                params![ecu_id],
                raw_connection_row,
            )
            .optional()?;
        raw.map(RawConnectionRow::decode).transpose()
    }

    /// Snapshot rows ordered by device id, optionally filtered by status.
    pub fn connections(&self, status: Option<ConnectionStatus>) -> Result<Vec<ConnectionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT ecu_id, protocol, ip_address, port, connected_at, last_heartbeat, status
             FROM ecu_connections
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY ecu_id",
        )?;
        let rows = stmt.query_map(
            params![status.map(ConnectionStatus::as_str)],
            raw_connection_row,
        )?;
        rows.map(|r| r.map_err(StoreError::from).and_then(RawConnectionRow::decode))
            .collect()
    }

    /// Counts per action type and per connection status.
    pub fn statistics(&self) -> Result<LogStatistics> {
        let conn = self.conn()?;
        let mut stats = LogStatistics::default();

        let mut stmt = conn.prepare_cached(
            "SELECT action_type, COUNT(*) FROM ecu_admin_logs GROUP BY action_type",
        )?;
        for row in stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))? {
            let (kind, count) = row?;
            let count = u64::try_from(count).unwrap_or_default();
            stats.total_logs += count;
            let _ = stats.logs_by_type.insert(kind, count);
        }

        let mut stmt = conn
            .prepare_cached("SELECT status, COUNT(*) FROM ecu_connections GROUP BY status")?;
        for row in stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))? {
            let (status, count) = row?;
            let count = u64::try_from(count).unwrap_or_default();
            stats.total_devices += count;
            let _ = stats.devices_by_status.insert(status, count);
        }

        Ok(stats)
    }
}

impl AdminLogStore for SqliteStore {
    #[instrument(skip_all, fields(count = entries.len()))]
    fn append_batch(&self, entries: &[ActionLogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO ecu_admin_logs
                 (ecu_id, action_type, action_data, result, admin_user, ip_address, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for entry in entries {
                let action_data = serde_json::to_string(&entry.action)?;
                let result = entry.result.as_ref().map(serde_json::to_string).transpose()?;
                let _ = stmt.execute(params![
                    entry.ecu_id.as_str(),
                    entry.action_type().as_str(),
                    action_data,
                    result,
                    entry.admin_user,
                    entry.ip_address,
                    format_ts(entry.created_at),
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = entries.len(), "admin log batch committed");
        Ok(())
    }
}

impl ConnectionStore for SqliteStore {
    fn upsert(&self, record: &ConnectionRecord) -> Result<()> {
        let conn = self.conn()?;
        let _ = conn.prepare_cached(
            "INSERT INTO ecu_connections
             (ecu_id, protocol, ip_address, port, connected_at, last_heartbeat, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(ecu_id) DO UPDATE SET
               protocol = excluded.protocol,
               ip_address = excluded.ip_address,
               port = excluded.port,
               connected_at = excluded.connected_at,
               last_heartbeat = excluded.last_heartbeat,
               status = excluded.status",
        )?
        .execute(params![
            record.ecu_id.as_str(),
            record.protocol.as_str(),
            record.ip_address,
            record.port,
            format_ts(record.connected_at),
            record.last_heartbeat.map(format_ts),
            record.status.as_str(),
        ])?;
        Ok(())
    }

    fn mark_status(&self, ecu_id: &EcuId, status: ConnectionStatus) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .prepare_cached("UPDATE ecu_connections SET status = ?2 WHERE ecu_id = ?1")?
            .execute(params![ecu_id.as_str(), status.as_str()])?;
        if changed == 0 {
            debug!(ecu_id = %ecu_id, %status, "mark_status on device without snapshot row");
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp {raw:?}: {e}")))
}

struct RawLogRow {
    id: i64,
    ecu_id: String,
    action_type: String,
    action_data: String,
    result: Option<String>,
    admin_user: String,
    ip_address: Option<String>,
    created_at: String,
}

fn raw_log_row(row: &Row<'_>) -> rusqlite::Result<RawLogRow> {
    Ok(RawLogRow {
        id: row.get(0)?,
        ecu_id: row.get(1)?,
        action_type: row.get(2)?,
        action_data: row.get(3)?,
        result: row.get(4)?,
        admin_user: row.get(5)?,
        ip_address: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl RawLogRow {
    fn decode(self) -> Result<AdminLogRow> {
        let result: Option<Value> = self.result.as_deref().map(serde_json::from_str).transpose()?;
        Ok(AdminLogRow {
            id: self.id,
            ecu_id: self.ecu_id,
            action_type: self.action_type.parse()?,
            action_data: serde_json::from_str(&self.action_data)?,
            result,
            admin_user: self.admin_user,
            ip_address: self.ip_address,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct RawConnectionRow {
    ecu_id: String,
    protocol: String,
    ip_address: Option<String>,
    port: Option<u16>,
    connected_at: String,
    last_heartbeat: Option<String>,
    status: String,
}

fn raw_connection_row(row: &Row<'_>) -> rusqlite::Result<RawConnectionRow> {
    Ok(RawConnectionRow {
        ecu_id: row.get(0)?,
        protocol: row.get(1)?,
        ip_address: row.get(2)?,
        port: row.get(3)?,
        connected_at: row.get(4)?,
        last_heartbeat: row.get(5)?,
        status: row.get(6)?,
    })
}

impl RawConnectionRow {
    fn decode(self) -> Result<ConnectionRecord> {
        Ok(ConnectionRecord {
            ecu_id: EcuId::parse(self.ecu_id).map_err(|e| StoreError::InvalidData(e.to_string()))?,
            protocol: self
                .protocol
                .parse::<Protocol>()
                .map_err(|e| StoreError::InvalidData(e.to_string()))?,
            ip_address: self.ip_address,
            port: self.port,
            connected_at: parse_ts(&self.connected_at)?,
            last_heartbeat: self.last_heartbeat.as_deref().map(parse_ts).transpose()?,
            status: self.status.parse()?,
            session_epoch: 0,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::{ConnectionConfig, new_in_memory, run_migrations};
    use crate::types::{ActionData, CommandData, ConnectData, HeartbeatData};
    use serde_json::json;

    fn make_store() -> SqliteStore {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        {
            let conn = pool.get().unwrap();
            let _ = run_migrations(&conn).unwrap();
        }
        SqliteStore::new(pool)
    }

    fn ecu(id: &str) -> EcuId {
        EcuId::parse(id).unwrap()
    }

    fn connect_entry(id: &str) -> ActionLogEntry {
        ActionLogEntry::new(
            ecu(id),
            ActionData::Connect(ConnectData {
                protocol: Protocol::Websocket,
                ip_address: Some("10.1.2.3".into()),
                port: Some(40_000),
                session_epoch: 1,
                takeover: false,
            }),
        )
        .with_ip(Some("10.1.2.3".into()))
    }

    fn heartbeat_entry(id: &str, beats: u64) -> ActionLogEntry {
        ActionLogEntry::new(
            ecu(id),
            ActionData::Heartbeat(HeartbeatData {
                beats,
                session_epoch: 1,
            }),
        )
    }

    fn record(id: &str, status: ConnectionStatus) -> ConnectionRecord {
        ConnectionRecord {
            ecu_id: ecu(id),
            protocol: Protocol::Websocket,
            ip_address: Some("10.1.2.3".into()),
            port: Some(40_000),
            connected_at: Utc::now(),
            last_heartbeat: None,
            status,
            session_epoch: 3,
        }
    }

    #[test]
    fn append_and_read_back_in_order() {
        let store = make_store();
        store
            .append_batch(&[
                connect_entry("bike_1"),
                heartbeat_entry("bike_1", 1),
                heartbeat_entry("bike_1", 2),
            ])
            .unwrap();

        let rows = store.device_logs("bike_1", &LogQuery::default()).unwrap();
        assert_eq!(rows.len(), 3);
        // newest first
        assert_eq!(rows[0].action_type, ActionType::Heartbeat);
        assert_eq!(rows[0].action_data["beats"], 2);
        assert_eq!(rows[2].action_type, ActionType::Connect);
        assert_eq!(rows[2].ip_address.as_deref(), Some("10.1.2.3"));
        assert_eq!(rows[2].admin_user, "system");
        assert!(matches!(rows[2].action().unwrap(), ActionData::Connect(_)));
    }

    #[test]
    fn result_column_round_trips() {
        let store = make_store();
        let entry = ActionLogEntry::new(
            ecu("gate_1"),
            ActionData::Command(CommandData {
                request_id: Some("7".into()),
                method: "ping".into(),
                params: json!({}),
                timestamp: Utc::now(),
            }),
        )
        .with_result(json!({"status": "success", "result": {"pong": true}}));
        store.append_batch(&[entry]).unwrap();

        let rows = store.recent_logs(10).unwrap();
        assert_eq!(rows[0].result.as_ref().unwrap()["result"]["pong"], true);
    }

    #[test]
    fn device_logs_filters_by_type_and_limit() {
        let store = make_store();
        let mut batch = vec![connect_entry("bike_2")];
        batch.extend((1..=5).map(|n| heartbeat_entry("bike_2", n)));
        batch.push(heartbeat_entry("other", 1));
        store.append_batch(&batch).unwrap();

        let query = LogQuery {
            action_type: Some(ActionType::Heartbeat),
            limit: 3,
        };
        let rows = store.device_logs("bike_2", &query).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.action_type == ActionType::Heartbeat));
        assert!(rows.iter().all(|r| r.ecu_id == "bike_2"));
    }

    #[test]
    fn empty_batch_is_noop() {
        let store = make_store();
        store.append_batch(&[]).unwrap();
        assert!(store.recent_logs(10).unwrap().is_empty());
    }

    #[test]
    fn upsert_updates_in_place() {
        let store = make_store();
        store.upsert(&record("bike_3", ConnectionStatus::Connected)).unwrap();
        let mut updated = record("bike_3", ConnectionStatus::Connected);
        updated.last_heartbeat = Some(Utc::now());
        updated.port = Some(41_000);
        store.upsert(&updated).unwrap();

        let all = store.connections(None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].port, Some(41_000));
        assert!(all[0].last_heartbeat.is_some());
        assert_eq!(all[0].session_epoch, 0);
    }

    #[test]
    fn mark_status_and_filter() {
        let store = make_store();
        store.upsert(&record("a", ConnectionStatus::Connected)).unwrap();
        store.upsert(&record("b", ConnectionStatus::Connected)).unwrap();
        store.mark_status(&ecu("b"), ConnectionStatus::Timeout).unwrap();
        store.mark_status(&ecu("missing"), ConnectionStatus::Timeout).unwrap();

        let connected = store.connections(Some(ConnectionStatus::Connected)).unwrap();
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].ecu_id.as_str(), "a");
        assert_eq!(
            store.connection("b").unwrap().unwrap().status,
            ConnectionStatus::Timeout
        );
        assert!(store.connection("missing").unwrap().is_none());
    }

    #[test]
    fn statistics_counts() {
        let store = make_store();
        store
            .append_batch(&[
                connect_entry("a"),
                connect_entry("b"),
                heartbeat_entry("a", 1),
            ])
            .unwrap();
        store.upsert(&record("a", ConnectionStatus::Connected)).unwrap();
        store.upsert(&record("b", ConnectionStatus::Disconnected)).unwrap();

        let stats = store.statistics().unwrap();
        assert_eq!(stats.total_logs, 3);
        assert_eq!(stats.logs_by_type["connect"], 2);
        assert_eq!(stats.logs_by_type["heartbeat"], 1);
        assert_eq!(stats.total_devices, 2);
        assert_eq!(stats.devices_by_status["disconnected"], 1);
    }
}
