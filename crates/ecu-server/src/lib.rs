//! # ecu-server
//!
//! Southbound server: the WebSocket transport adapter devices connect to,
//! plus the operator HTTP endpoints.
//!
//! - `GET /` service banner
//! - `GET /health` liveness, device counts and pending commands
//! - `GET /metrics` Prometheus text
//! - `GET /ws/ecu` device socket (path configurable)
//!
//! [`WsTransport`] implements [`ecu_runtime::Transport`] so the gateway's
//! dispatcher can reach whichever socket currently serves a device.

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::{HandshakeError, ServerError};
pub use server::{AppState, EcuServer};
pub use shutdown::ShutdownCoordinator;
pub use websocket::{Outbound, WsTransport};
