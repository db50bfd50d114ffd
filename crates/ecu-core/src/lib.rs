//! # ecu-core
//!
//! Foundation types shared by every ECU gateway crate.
//!
//! - **Branded IDs**: [`EcuId`] (validated device key) and [`ConnectionId`]
//! - **Protocol tags**: [`Protocol`] for the transport a device arrived on
//! - **Retry math**: [`RetryConfig`] and exponential backoff with jitter
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` stack
//! - **Constants**: defaults shared across settings and runtime

#![deny(unsafe_code)]

pub mod constants;
pub mod ids;
pub mod logging;
pub mod retry;

pub use ids::{ConnectionId, EcuId, IdError, Protocol};
pub use retry::{RetryConfig, calculate_backoff_delay_with_random};
