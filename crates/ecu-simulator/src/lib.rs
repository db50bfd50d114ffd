//! # ecu-simulator
//!
//! Simulated ECU devices for development and testing.
//!
//! [`SimulatedFleet`] implements the gateway's [`ecu_runtime::Transport`]
//! and drives an attached [`ecu_runtime::TransportListener`], so the session
//! core cannot tell simulated devices from socket-backed ones. Devices send
//! heartbeats, answer `ping`, `get_status` and `device_info`, echo other
//! methods, and fail or drop commands at configurable rates.

#![deny(unsafe_code)]

pub mod config;
pub mod device;
pub mod errors;
pub mod fleet;

pub use config::SimulatorConfig;
pub use device::{Faults, Reply, SimulatedDevice};
pub use errors::SimulatorError;
pub use fleet::{SimulatedFleet, SimulatorStats};
