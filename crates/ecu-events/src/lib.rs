//! # ecu-events
//!
//! Durable record of what happened to every device.
//!
//! - **Model**: [`ActionLogEntry`] rows for `ecu_admin_logs`, typed by
//!   [`ActionData`], and [`ConnectionRecord`] rows for `ecu_connections`
//! - **Store boundary**: [`AdminLogStore`] and [`ConnectionStore`], with a
//!   `SQLite` implementation ([`sqlite::SqliteStore`]) and an in-process one
//!   ([`MemoryStore`]) that supports fault injection
//! - **Pipeline**: [`ActionLogPipeline`] batches entries off the hot path,
//!   retries sink failures, and escalates when audit-critical entries are
//!   at risk

#![deny(unsafe_code)]

pub mod errors;
pub mod memory;
pub mod pipeline;
pub mod sqlite;
pub mod store;
pub mod types;

pub use errors::{Result, StoreError};
pub use memory::MemoryStore;
pub use pipeline::{ActionLogPipeline, Admission, FlushReport, PipelineConfig, PipelineStats};
pub use store::{AdminLogStore, ConnectionStore, SnapshotOp};
pub use types::{
    ActionData, ActionLogEntry, ActionType, AdminLogRow, CommandData, ConnectData,
    ConnectionRecord, ConnectionStatus, DisconnectData, DisconnectReason, ErrorData, ErrorKind,
    HeartbeatData, StatusUpdateData,
};
