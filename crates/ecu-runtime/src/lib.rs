//! # ecu-runtime
//!
//! Session core of the southbound gateway.
//!
//! - **Registry**: [`SessionRegistry`] tracks one session per device,
//!   serializes operations per device, and supersedes duplicate connects
//! - **State machine**: [`state::next_state`] is the single transition table
//! - **Liveness**: [`HeartbeatMonitor`] demotes sessions that stay silent
//!   past the timeout
//! - **Dispatch**: [`CommandDispatcher`] correlates JSON-RPC requests with
//!   responses, enforces deadlines, and routes device-initiated calls
//! - **Transport seam**: [`Transport`] and [`TransportListener`] decouple the
//!   core from sockets; [`Gateway`] assembles everything behind the listener

#![deny(unsafe_code)]

pub mod dispatcher;
pub mod errors;
pub mod gateway;
pub mod heartbeat;
pub mod inbound;
pub mod registry;
pub mod state;
pub mod transport;

pub use dispatcher::{CommandDispatcher, DispatcherConfig, PendingSummary};
pub use errors::{DispatchError, RegistryError, TransportError};
pub use gateway::{Gateway, RuntimeConfig};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor, MonitorExit, SweepReport};
pub use inbound::{DeviceInbound, InboundHandler};
pub use registry::{RegistryConfig, SessionCounts, SessionRegistry};
pub use state::SessionEvent;
pub use transport::{PeerInfo, Transport, TransportListener};
