//! `SQLite` backend: pooled connections, embedded migrations, and the
//! store implementation with its read-side queries.

pub mod connection;
pub mod migrations;
pub mod store;

pub use connection::{ConnectionConfig, ConnectionPool, new_file, new_in_memory};
pub use migrations::run_migrations;
pub use store::{LogQuery, LogStatistics, SqliteStore};
