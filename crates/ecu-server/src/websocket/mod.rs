//! Device-facing WebSocket adapter.
//!
//! - [`handshake`]: first-frame identity check and acknowledgement
//! - [`session`]: per-socket reader and writer tasks
//! - [`transport`]: routing from the session core to the right socket

pub mod handshake;
pub mod session;
pub mod transport;

pub use handshake::{Handshake, parse_handshake};
pub use session::{SessionContext, run_ws_session};
pub use transport::{Outbound, WsTransport};
